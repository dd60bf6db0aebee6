// src/provider/fs.rs

use tokio::sync::watch;
use tonic::transport::Channel;

use crate::error::ProviderError;
use crate::pb;
use crate::pb::file_system_client::FileSystemClient;
use crate::provider::PrivilegeState;

/// Capability handle for file operations inside the helper's mount
/// namespace, scoped to what the daemon intentionally serves. Valid only
/// while the connector reports SUCCEEDED; calls made after disconnection
/// fail hard instead of silently doing nothing.
#[derive(Clone)]
pub struct RemoteFileSystem {
    client: FileSystemClient<Channel>,
    state: watch::Receiver<PrivilegeState>,
}

impl RemoteFileSystem {
    pub(crate) fn new(channel: Channel, state: watch::Receiver<PrivilegeState>) -> Self {
        Self {
            client: FileSystemClient::new(channel),
            state,
        }
    }

    fn guard(&self) -> Result<(), ProviderError> {
        match *self.state.borrow() {
            PrivilegeState::Succeeded => Ok(()),
            _ => Err(ProviderError::NotAlive),
        }
    }

    pub async fn stat(&self, path: &str) -> Result<pb::StatReply, ProviderError> {
        self.guard()?;
        let mut client = self.client.clone();
        Ok(client
            .stat(pb::PathRequest {
                path: path.to_string(),
            })
            .await?
            .into_inner())
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<pb::DirEntry>, ProviderError> {
        self.guard()?;
        let mut client = self.client.clone();
        Ok(client
            .list_dir(pb::PathRequest {
                path: path.to_string(),
            })
            .await?
            .into_inner()
            .entries)
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>, ProviderError> {
        self.guard()?;
        let mut client = self.client.clone();
        Ok(client
            .read_file(pb::PathRequest {
                path: path.to_string(),
            })
            .await?
            .into_inner()
            .content)
    }

    /// Atomic write: the daemon stages a temp file, applies `mode` (octal
    /// string, "0644" when unparsable), then renames into place.
    pub async fn write(&self, path: &str, content: Vec<u8>, mode: &str) -> Result<(), ProviderError> {
        self.guard()?;
        let mut client = self.client.clone();
        let reply = client
            .write_file(pb::WriteFileRequest {
                path: path.to_string(),
                content,
                file_mode: mode.to_string(),
            })
            .await?
            .into_inner();
        if !reply.ok {
            return Err(ProviderError::FileSystem(reply.error));
        }
        Ok(())
    }

    /// Removes a file or a directory tree.
    pub async fn remove(&self, path: &str) -> Result<(), ProviderError> {
        self.guard()?;
        let mut client = self.client.clone();
        let reply = client
            .remove(pb::PathRequest {
                path: path.to_string(),
            })
            .await?
            .into_inner();
        if !reply.ok {
            return Err(ProviderError::FileSystem(reply.error));
        }
        Ok(())
    }
}
