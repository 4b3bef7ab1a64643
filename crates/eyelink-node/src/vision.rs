//! Vision provider seam on the eye side.
//!
//! The provider is whatever actually produces media: it is told what the
//! server asked for and where the server's data port is, and it writes a
//! raw byte stream there. The eye client never looks at the bytes.

use std::future::Future;
use std::net::SocketAddr;
use std::process::ExitStatus;

use eyelink_protocol::{RequestPicture, RequestStream, VisionRequestType};
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq)]
pub enum VisionRequest {
    Stream(RequestStream),
    Picture(RequestPicture),
}

impl VisionRequest {
    pub fn kind(&self) -> VisionRequestType {
        match self {
            VisionRequest::Stream(_) => VisionRequestType::Stream,
            VisionRequest::Picture(_) => VisionRequestType::Picture,
        }
    }

    /// Server data port the media goes to.
    pub fn port(&self) -> u16 {
        match self {
            VisionRequest::Stream(r) => r.port,
            VisionRequest::Picture(r) => r.port,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("no command configured for {0} requests")]
    NotConfigured(&'static str),
    #[error("vision command exited with {0}")]
    CommandFailed(ExitStatus),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces media for a vision request.
pub trait VisionProvider: Send + Sync + 'static {
    /// Deliver the requested media to `data_addr`. Returns once delivery
    /// has finished or failed.
    fn capture(
        &self,
        request: VisionRequest,
        data_addr: SocketAddr,
    ) -> impl Future<Output = Result<(), VisionError>> + Send;
}

/// Runs an external program per request.
///
/// Each argument may contain `{width}`, `{height}`, `{host}` and `{port}`;
/// stream commands also get `{length}` and `{framerate}`.
#[derive(Debug, Clone, Default)]
pub struct CommandProvider {
    pub picture_command: Option<Vec<String>>,
    pub stream_command: Option<Vec<String>>,
}

impl CommandProvider {
    pub fn new(picture_command: Option<Vec<String>>, stream_command: Option<Vec<String>>) -> Self {
        Self {
            picture_command,
            stream_command,
        }
    }

    /// Program and arguments for `request`, placeholders filled in.
    pub fn command_line(
        &self,
        request: &VisionRequest,
        data_addr: SocketAddr,
    ) -> Result<Vec<String>, VisionError> {
        let (template, vars) = match request {
            VisionRequest::Picture(r) => (
                self.picture_command.as_ref(),
                vec![
                    ("{width}", r.picture_width.to_string()),
                    ("{height}", r.picture_height.to_string()),
                ],
            ),
            VisionRequest::Stream(r) => (
                self.stream_command.as_ref(),
                vec![
                    ("{width}", r.video_width.to_string()),
                    ("{height}", r.video_height.to_string()),
                    ("{length}", r.stream_length.to_string()),
                    ("{framerate}", r.framerate.to_string()),
                ],
            ),
        };
        let template = template
            .filter(|t| !t.is_empty())
            .ok_or(VisionError::NotConfigured(request.kind().name()))?;

        let host = data_addr.ip().to_string();
        let port = data_addr.port().to_string();
        Ok(template
            .iter()
            .map(|arg| {
                let mut arg = arg.replace("{host}", &host).replace("{port}", &port);
                for (key, value) in &vars {
                    arg = arg.replace(key, value);
                }
                arg
            })
            .collect())
    }
}

impl VisionProvider for CommandProvider {
    async fn capture(
        &self,
        request: VisionRequest,
        data_addr: SocketAddr,
    ) -> Result<(), VisionError> {
        let argv = self.command_line(&request, data_addr)?;
        let Some((program, args)) = argv.split_first() else {
            return Err(VisionError::NotConfigured(request.kind().name()));
        };

        tracing::info!(
            request = request.kind().name(),
            %data_addr,
            program = %program,
            "vision: running capture command"
        );
        let status = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .status()
            .await?;
        if !status.success() {
            return Err(VisionError::CommandFailed(status));
        }
        Ok(())
    }
}
