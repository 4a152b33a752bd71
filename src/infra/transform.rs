//! Transform engines.
//!
//! [`CommandTransformEngine`] pipes the source through an external program: the configured
//! arguments come first, then one argument per instruction pair (`width=200`), then
//! `format=<ext>` when the instruction does not name a format. The program writes the encoded
//! image to stdout.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::application::ports::{TransformEngine, TransformError, TransformOutput};

const SOURCE: &str = "infra::transform";

/// Exit status a program uses to reject an instruction it does not understand.
const EXIT_UNSUPPORTED: i32 = 64;
/// Exit status a program uses when the source cannot be decoded.
const EXIT_MALFORMED: i32 = 65;

fn content_type_for(extension: &str) -> String {
    mime_guess::from_ext(extension)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[derive(Debug, Clone)]
pub struct CommandTransformEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTransformEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command_args(&self, instruction: &str, output_extension: &str) -> Vec<String> {
        let mut args = self.args.clone();
        let mut has_format = false;
        for pair in instruction.split('&').filter(|pair| !pair.is_empty()) {
            has_format |= pair
                .split_once('=')
                .is_some_and(|(name, _)| name.eq_ignore_ascii_case("format"));
            args.push(pair.to_string());
        }
        if !has_format && !output_extension.is_empty() {
            args.push(format!("format={output_extension}"));
        }
        args
    }
}

#[async_trait]
impl TransformEngine for CommandTransformEngine {
    async fn transform(
        &self,
        source: Bytes,
        instruction: &str,
        output_extension: &str,
    ) -> Result<TransformOutput, TransformError> {
        let started_at = Instant::now();
        let mut child = Command::new(&self.program)
            .args(self.command_args(instruction, output_extension))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                warn!(
                    target = SOURCE,
                    op = "transform",
                    result = "error",
                    error_code = "spawn",
                    program = %self.program.display(),
                    error = %err,
                    "Failed to spawn transform program"
                );
                if err.kind() == ErrorKind::NotFound {
                    TransformError::Engine(format!(
                        "transform program `{}` not found",
                        self.program.display()
                    ))
                } else {
                    TransformError::Engine(err.to_string())
                }
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransformError::Engine("stdin was not captured".into()))?;
        let writer = tokio::spawn(async move {
            // A program that exits without reading all input closes the pipe early.
            let result = stdin.write_all(&source).await;
            drop(stdin);
            match result {
                Err(err) if err.kind() != ErrorKind::BrokenPipe => Err(err),
                _ => Ok(()),
            }
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| TransformError::Engine(err.to_string()))?;
        writer
            .await
            .map_err(|err| TransformError::Engine(err.to_string()))?
            .map_err(|err| TransformError::Engine(err.to_string()))?;

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let exit_code = output.status.code();
            warn!(
                target = SOURCE,
                op = "transform",
                result = "error",
                exit_code = exit_code.map(i64::from).unwrap_or(-1),
                elapsed_ms,
                stderr = %stderr,
                "Transform program failed"
            );
            return Err(match exit_code {
                Some(EXIT_UNSUPPORTED) => TransformError::Unsupported(instruction.to_string()),
                Some(EXIT_MALFORMED) => TransformError::Malformed(stderr),
                _ => TransformError::Engine(format!("exit {exit_code:?}: {stderr}")),
            });
        }
        if output.stdout.is_empty() {
            return Err(TransformError::Engine("transform produced no output".into()));
        }

        debug!(
            target = SOURCE,
            op = "transform",
            result = "ok",
            elapsed_ms,
            output_bytes = output.stdout.len(),
            "Transform program finished"
        );
        Ok(TransformOutput {
            bytes: Bytes::from(output.stdout),
            content_type: content_type_for(output_extension),
        })
    }
}

/// Returns the source unchanged, labelled with the requested output type.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEngine;

#[async_trait]
impl TransformEngine for PassthroughEngine {
    async fn transform(
        &self,
        source: Bytes,
        _instruction: &str,
        output_extension: &str,
    ) -> Result<TransformOutput, TransformError> {
        if source.is_empty() {
            return Err(TransformError::Malformed("empty source".into()));
        }
        Ok(TransformOutput {
            bytes: source,
            content_type: content_type_for(output_extension),
        })
    }
}
