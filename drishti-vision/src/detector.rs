//! The opaque detection capability.

use crate::error::VisionError;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Placeholder replaced by the input image path in detector arguments
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// A finding as reported by a detector, before normalization.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawDetection {
    pub label: String,
    #[serde(alias = "confidence")]
    pub score: f64,
    #[serde(rename = "box", alias = "bbox")]
    pub bbox: [f64; 4],
}

impl RawDetection {
    pub fn new(label: impl Into<String>, score: f64, bbox: [f64; 4]) -> Self {
        Self {
            label: label.into(),
            score,
            bbox,
        }
    }
}

/// Image on disk in, raw findings out. One call is one attempt; callers do
/// not retry.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, image_path: &Path) -> Result<Vec<RawDetection>, VisionError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandOutput {
    List(Vec<RawDetection>),
    Wrapped { detections: Vec<RawDetection> },
}

/// Runs an external program per image and reads JSON from its stdout.
///
/// Output is either `[{"label", "score", "box"}]` or the same list under a
/// `detections` key. Any `{input}` in the arguments becomes the image path;
/// without one, the path is appended as the last argument.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandDetector {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a command line like `python detect.py {input}`.
    /// Extra `args` are appended after the command's own words.
    pub fn from_command_line(command: &str, args: &[String]) -> Result<Self, VisionError> {
        let mut words = command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| VisionError::Config("Detector command is empty".to_string()))?;
        let mut all_args: Vec<String> = words.map(str::to_string).collect();
        all_args.extend(args.iter().cloned());
        Ok(Self::new(program, all_args))
    }

    fn arguments_for(&self, image_path: &Path) -> Vec<String> {
        let input = image_path.to_string_lossy();
        let mut substituted = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(INPUT_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(INPUT_PLACEHOLDER, &input)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(input.into_owned());
        }
        args
    }
}

pub(crate) fn parse_output(stdout: &[u8]) -> Result<Vec<RawDetection>, VisionError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|e| VisionError::Output(format!("stdout is not UTF-8: {}", e)))?
        .trim();
    if text.is_empty() {
        return Err(VisionError::Output("detector produced no output".to_string()));
    }
    match serde_json::from_str::<CommandOutput>(text) {
        Ok(CommandOutput::List(list)) => Ok(list),
        Ok(CommandOutput::Wrapped { detections }) => Ok(detections),
        Err(e) => Err(VisionError::Output(format!("unparseable detector output: {}", e))),
    }
}

#[async_trait]
impl Detector for CommandDetector {
    async fn detect(&self, image_path: &Path) -> Result<Vec<RawDetection>, VisionError> {
        let args = self.arguments_for(image_path);
        debug!("Running detector {:?} {:?}", self.program, args);

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VisionError::Detector(format!("failed to start {:?}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VisionError::Detector(format!(
                "{:?} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        parse_output(&output.stdout)
    }
}

/// Stand-in used when no detector is configured. Every call fails, while
/// the query endpoints keep working.
#[derive(Debug, Clone, Default)]
pub struct DisabledDetector;

#[async_trait]
impl Detector for DisabledDetector {
    async fn detect(&self, _image_path: &Path) -> Result<Vec<RawDetection>, VisionError> {
        Err(VisionError::Config(
            "No detector command configured (inference.command)".to_string(),
        ))
    }
}
