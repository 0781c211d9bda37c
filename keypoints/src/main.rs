//! This crate wraps the keypoint regressor into a command line interface,
//! to predict facial keypoints for images on disk.

use env_logger::Builder;
use keypoints::{draw_keypoints, keypoints_to_json, load_input, load_model};
use log::info;
use ml::{keypoints::Keypoints, models::Architecture};
use quicli::prelude::{CliResult, Verbosity};
use std::{fs, path::PathBuf};
use structopt::StructOpt;

/// Predicts the 68 facial keypoints of a face image
#[derive(Debug, StructOpt)]
struct PredictOpts {
    /// Path to the face image (.png, .jpg) or to a (224, 224) .npy array with values in [0, 1]
    #[structopt(parse(from_os_str))]
    image: PathBuf,
    /// Trained parameters (.npz or .json). Uses a randomly initialized network if not given.
    #[structopt(short = "w", long = "weights", parse(from_os_str))]
    weights: Option<PathBuf>,
    /// Seed of the random initialization
    #[structopt(long = "seed", default_value = "0")]
    seed: u64,
    /// Keypoints are reported as value * scale + offset
    #[structopt(long = "scale", default_value = "1.0")]
    scale: f32,
    /// Keypoints are reported as value * scale + offset
    #[structopt(long = "offset", default_value = "0.0")]
    offset: f32,
    /// Writes the keypoints as JSON to this path instead of StdOut
    #[structopt(short = "o", long = "output", parse(from_os_str))]
    output: Option<PathBuf>,
    /// Saves the network input with the keypoints drawn onto it
    #[structopt(short = "a", long = "annotate", parse(from_os_str))]
    annotate: Option<PathBuf>,
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Prints the layers of the network
#[derive(Debug, StructOpt)]
struct DescribeOpts {
    #[structopt(flatten)]
    verbosity: Verbosity,
}

/// Facial keypoint detection with a convolutional neural network.
#[derive(Debug, StructOpt)]
#[structopt(name = "keypoints")]
enum KeypointsCli {
    #[structopt(
        name = "predict",
        about = "Predicts the 68 facial keypoints of a face image."
    )]
    Predict(PredictOpts),
    #[structopt(
        name = "describe",
        about = "Prints the layers, output shapes and parameter counts of the network."
    )]
    Describe(DescribeOpts),
}

/// Trait for the subcommands that keypoints uses
trait KeypointsOpts {
    /// Performs the subcommand
    fn run(&self) -> CliResult;
    /// Returns the verbosity command
    fn get_verbosity(&self) -> &Verbosity;
    /// Sets up logging
    fn setup_env_logger(&self) -> CliResult {
        let mut builder = Builder::from_default_env();

        builder
            .filter(None, self.get_verbosity().log_level().to_level_filter())
            .init();

        Ok(())
    }
}

impl KeypointsOpts for PredictOpts {
    // Performs the prediction
    fn run(&self) -> CliResult {
        let (input, seen_image) = load_input(&self.image)?;
        let model = load_model(self.weights.as_deref(), self.seed)?;

        let predictions = model.forward(&input)?;
        let keypoints =
            Keypoints::from_row(predictions.row(0))?.denormalize(self.scale, self.offset);
        info!("Predicted {} keypoints", keypoints.len());

        let serialized = serde_json::to_string_pretty(&keypoints_to_json(&keypoints))?;
        match &self.output {
            Some(path) => fs::write(path, serialized)?,
            None => println!("{}", serialized),
        }

        if let Some(path) = &self.annotate {
            draw_keypoints(&seen_image, &keypoints).save(path)?;
            info!("Saved annotated image to {}", path.display());
        }
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl KeypointsOpts for DescribeOpts {
    // Prints out the architecture to StdOut
    fn run(&self) -> CliResult {
        let architecture = Architecture::keypoint_regressor();
        println!(
            "input: {}x{}x{}",
            architecture.input_size, architecture.input_size, architecture.input_channels
        );
        let shapes = architecture.block_output_shapes();
        for (index, (block, (channels, height, width))) in
            architecture.blocks.iter().zip(shapes).enumerate()
        {
            println!(
                "layer{}: {}x{} conv, {} -> {}, batch norm, relu, 2x2 max pool -> {}x{}x{} ({} parameters)",
                index + 1,
                block.kernel_size,
                block.kernel_size,
                block.input_channels,
                block.output_channels,
                height,
                width,
                channels,
                block.num_parameters()
            );
        }
        println!(
            "layer{}: linear, {} -> {}",
            architecture.blocks.len() + 1,
            architecture.flattened_width(),
            architecture.num_outputs
        );
        println!("parameters: {}", architecture.num_parameters());
        Ok(())
    }

    fn get_verbosity(&self) -> &Verbosity {
        &self.verbosity
    }
}

impl KeypointsOpts for KeypointsCli {
    fn run(&self) -> CliResult {
        match self {
            KeypointsCli::Predict(c) => c.run(),
            KeypointsCli::Describe(c) => c.run(),
        }
    }

    fn get_verbosity(&self) -> &Verbosity {
        match self {
            KeypointsCli::Predict(c) => c.get_verbosity(),
            KeypointsCli::Describe(c) => c.get_verbosity(),
        }
    }
}

fn main() -> CliResult {
    let args = KeypointsCli::from_args();
    args.setup_env_logger()?;
    args.run()
}
