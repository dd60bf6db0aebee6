// src/agent/server.rs

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs;
use tokio_stream::Stream;
use tonic::transport::server::{Router, Server, UdsConnectInfo};
use tonic::{Request, Response, Status};

use crate::agent::config::AgentConfig;
use crate::agent::sys::selinux;
use crate::agent::sys::traits::ModuleBackend;
use crate::pb;
use crate::pb::file_system_server::{FileSystem, FileSystemServer};
use crate::pb::module_manager_server::{ModuleManager, ModuleManagerServer};
use crate::pb::su_provider_server::{SuProvider, SuProviderServer};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

fn op_reply(result: Result<(), String>) -> Response<pb::OpReply> {
    match result {
        Ok(()) => Response::new(pb::OpReply {
            ok: true,
            error: String::new(),
        }),
        Err(error) => Response::new(pb::OpReply { ok: false, error }),
    }
}

// ==============================================================================
// Peer-credential enforcement
// ==============================================================================

// The socket itself is world-connectable; authorization is this check.
// Root and the single configured caller UID pass, everything else is
// rejected before a handler runs.
fn peer_guard(
    expected_uid: u32,
) -> impl Fn(Request<()>) -> Result<Request<()>, Status> + Clone + Send + Sync + 'static {
    move |request: Request<()>| {
        let Some(info) = request.extensions().get::<UdsConnectInfo>() else {
            return Err(Status::permission_denied("peer credentials unavailable"));
        };
        let Some(cred) = info.peer_cred else {
            return Err(Status::permission_denied("peer credentials unavailable"));
        };
        let uid = cred.uid();
        if uid != 0 && uid != expected_uid {
            return Err(Status::permission_denied(format!(
                "uid {} is not allowed on this socket",
                uid
            )));
        }
        Ok(request)
    }
}

// ==============================================================================
// SuProvider: handshake surface
// ==============================================================================

pub struct ProviderService {
    backend: Arc<dyn ModuleBackend>,
    started: Instant,
}

impl ProviderService {
    pub fn new(backend: Arc<dyn ModuleBackend>) -> Self {
        Self {
            backend,
            started: Instant::now(),
        }
    }
}

#[tonic::async_trait]
impl SuProvider for ProviderService {
    async fn get_context(
        &self,
        _request: Request<pb::GetContextRequest>,
    ) -> Result<Response<pb::GetContextReply>, Status> {
        Ok(Response::new(pb::GetContextReply {
            context: selinux::current_context(),
        }))
    }

    async fn get_platform(
        &self,
        _request: Request<pb::GetPlatformRequest>,
    ) -> Result<Response<pb::GetPlatformReply>, Status> {
        Ok(Response::new(pb::GetPlatformReply {
            platform: pb::Platform::from(self.backend.kind()) as i32,
        }))
    }

    type WatchStream = Pin<Box<dyn Stream<Item = Result<pb::Heartbeat, Status>> + Send + 'static>>;

    async fn watch(
        &self,
        _request: Request<pb::WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let started = self.started;
        let stream = async_stream::stream! {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tick.tick().await;
                yield Ok::<_, Status>(pb::Heartbeat {
                    uptime_secs: started.elapsed().as_secs() as i64,
                });
            }
        };
        Ok(Response::new(Box::pin(stream)))
    }
}

// ==============================================================================
// FileSystem: file operations inside the daemon's mount namespace
// ==============================================================================

#[derive(Default)]
pub struct FsService;

#[tonic::async_trait]
impl FileSystem for FsService {
    async fn stat(
        &self,
        request: Request<pb::PathRequest>,
    ) -> Result<Response<pb::StatReply>, Status> {
        let req = request.into_inner();
        let reply = match fs::metadata(&req.path).await {
            Ok(meta) => pb::StatReply {
                exists: true,
                is_dir: meta.is_dir(),
                size: meta.len(),
                modified: meta
                    .modified()
                    .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
                    .unwrap_or(0),
                mode: meta.permissions().mode(),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => pb::StatReply {
                exists: false,
                ..Default::default()
            },
            Err(e) => return Err(Status::internal(format!("stat {}: {}", req.path, e))),
        };
        Ok(Response::new(reply))
    }

    async fn list_dir(
        &self,
        request: Request<pb::PathRequest>,
    ) -> Result<Response<pb::ListDirReply>, Status> {
        let req = request.into_inner();
        let mut read_dir = fs::read_dir(&req.path)
            .await
            .map_err(|e| Status::internal(format!("read {}: {}", req.path, e)))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| Status::internal(format!("read {}: {}", req.path, e)))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(pb::DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Response::new(pb::ListDirReply { entries }))
    }

    async fn read_file(
        &self,
        request: Request<pb::PathRequest>,
    ) -> Result<Response<pb::ReadFileReply>, Status> {
        let req = request.into_inner();
        let content = fs::read(&req.path)
            .await
            .map_err(|e| Status::internal(format!("read {}: {}", req.path, e)))?;
        Ok(Response::new(pb::ReadFileReply { content }))
    }

    async fn write_file(
        &self,
        request: Request<pb::WriteFileRequest>,
    ) -> Result<Response<pb::OpReply>, Status> {
        let req = request.into_inner();

        if let Some(parent) = Path::new(&req.path).parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return Ok(op_reply(Err(format!("create directories: {}", e))));
            }
        }

        // Atomic write: temp file in place, permissions applied, then rename.
        let tmp_path = format!("{}.tmp", req.path);
        if let Err(e) = fs::write(&tmp_path, &req.content).await {
            return Ok(op_reply(Err(format!("write temp file: {}", e))));
        }

        let mode = u32::from_str_radix(&req.file_mode, 8).unwrap_or(0o644);
        if let Err(e) =
            fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(mode)).await
        {
            let _ = fs::remove_file(&tmp_path).await;
            return Ok(op_reply(Err(format!("set permissions: {}", e))));
        }

        if let Err(e) = fs::rename(&tmp_path, &req.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Ok(op_reply(Err(format!("atomic rename: {}", e))));
        }

        Ok(op_reply(Ok(())))
    }

    async fn remove(
        &self,
        request: Request<pb::PathRequest>,
    ) -> Result<Response<pb::OpReply>, Status> {
        let req = request.into_inner();
        let result = match fs::metadata(&req.path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&req.path).await,
            Ok(_) => fs::remove_file(&req.path).await,
            Err(e) => Err(e),
        };
        Ok(op_reply(
            result.map_err(|e| format!("remove {}: {}", req.path, e)),
        ))
    }
}

// ==============================================================================
// ModuleManager: privileged module lifecycle
// ==============================================================================

pub struct ModulesService {
    backend: Arc<dyn ModuleBackend>,
}

impl ModulesService {
    pub fn new(backend: Arc<dyn ModuleBackend>) -> Self {
        Self { backend }
    }
}

#[tonic::async_trait]
impl ModuleManager for ModulesService {
    async fn list_modules(
        &self,
        _request: Request<pb::ListModulesRequest>,
    ) -> Result<Response<pb::ListModulesReply>, Status> {
        let modules = self.backend.list().await.map_err(Status::internal)?;
        Ok(Response::new(pb::ListModulesReply {
            modules: modules.into_iter().map(Into::into).collect(),
        }))
    }

    async fn get_module(
        &self,
        request: Request<pb::ModuleIdRequest>,
    ) -> Result<Response<pb::GetModuleReply>, Status> {
        let req = request.into_inner();
        let module = self.backend.get(&req.id).await.map_err(Status::not_found)?;
        Ok(Response::new(pb::GetModuleReply {
            module: Some(module.into()),
        }))
    }

    async fn enable(
        &self,
        request: Request<pb::ModuleIdRequest>,
    ) -> Result<Response<pb::OpReply>, Status> {
        let req = request.into_inner();
        tracing::info!("enable module '{}'", req.id);
        Ok(op_reply(self.backend.enable(&req.id).await))
    }

    async fn disable(
        &self,
        request: Request<pb::ModuleIdRequest>,
    ) -> Result<Response<pb::OpReply>, Status> {
        let req = request.into_inner();
        tracing::info!("disable module '{}'", req.id);
        Ok(op_reply(self.backend.disable(&req.id).await))
    }

    async fn remove(
        &self,
        request: Request<pb::ModuleIdRequest>,
    ) -> Result<Response<pb::OpReply>, Status> {
        let req = request.into_inner();
        tracing::info!("stage removal of module '{}'", req.id);
        Ok(op_reply(self.backend.remove(&req.id).await))
    }
}

// ==============================================================================
// Assembly
// ==============================================================================

/// Builds the daemon's router: all three services behind the peer guard.
/// The integration suite drives this directly over a throwaway socket.
pub fn router(config: &AgentConfig, backend: Arc<dyn ModuleBackend>) -> Router {
    let guard = peer_guard(config.expected_caller_uid);
    Server::builder()
        .add_service(SuProviderServer::with_interceptor(
            ProviderService::new(backend.clone()),
            guard.clone(),
        ))
        .add_service(FileSystemServer::with_interceptor(
            FsService,
            guard.clone(),
        ))
        .add_service(ModuleManagerServer::with_interceptor(
            ModulesService::new(backend),
            guard,
        ))
}
