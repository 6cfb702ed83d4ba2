//! Unix-domain-socket HTTP surface. One POST endpoint carries every
//! brokered request; the socket file (or a systemd-passed fd) is the trust
//! boundary.

use std::os::fd::{BorrowedFd, FromRawFd, RawFd};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use warden_contracts::{ErrorCode, ErrorInfo, Request, Response};

use crate::broker::Broker;
use crate::config::StartupError;

const MAX_BODY_BYTES: usize = 1 << 20;
const SYSTEMD_LISTEN_FD: RawFd = 3;

#[derive(Clone)]
struct AppState {
    broker: Arc<Broker>,
}

pub fn router(broker: Arc<Broker>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/request", post(handle_request))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(AppState { broker })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn handle_request(
    State(state): State<AppState>,
    req: Result<Json<Request>, JsonRejection>,
) -> (StatusCode, Json<Response>) {
    let Json(req) = match req {
        Ok(req) => req,
        Err(rejection) => {
            let resp = Response::failure(
                "",
                ErrorInfo::new(ErrorCode::BadRequest, "invalid json")
                    .with_details(rejection.body_text()),
            );
            return (StatusCode::BAD_REQUEST, Json(resp));
        }
    };

    let resp = state.broker.handle(&req).await;
    let status = if resp.ok {
        StatusCode::OK
    } else {
        resp.error
            .as_ref()
            .map(|err| status_for_error(err.code))
            .unwrap_or(StatusCode::BAD_REQUEST)
    };
    (status, Json(resp))
}

pub fn status_for_error(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
        ErrorCode::RedactionError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Serves until SIGINT/SIGTERM. Adopts a systemd-passed listener when the
/// activation environment matches, otherwise binds `socket_path` with mode
/// 0660 after clearing any stale socket file.
pub async fn serve(socket_path: &str, broker: Arc<Broker>) -> Result<(), StartupError> {
    let (std_listener, activated) = match systemd_listener()? {
        Some(listener) => (listener, true),
        None => {
            if socket_path.is_empty() {
                return Err(StartupError {
                    code: "ERR_SOCKET_PATH",
                    message: "socket path is required".to_string(),
                });
            }
            remove_socket_if_exists(socket_path)?;
            let listener = StdUnixListener::bind(socket_path).map_err(|err| StartupError {
                code: "ERR_BIND_FAILED",
                message: format!("failed to bind {socket_path}: {err}"),
            })?;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))
                .map_err(|err| StartupError {
                    code: "ERR_SOCKET_PERMISSIONS",
                    message: format!("failed to chmod {socket_path}: {err}"),
                })?;
            (listener, false)
        }
    };

    std_listener.set_nonblocking(true).map_err(|err| StartupError {
        code: "ERR_SOCKET_SETUP",
        message: format!("failed to configure listener: {err}"),
    })?;
    let listener = tokio::net::UnixListener::from_std(std_listener).map_err(|err| StartupError {
        code: "ERR_SOCKET_SETUP",
        message: format!("failed to register listener: {err}"),
    })?;

    tracing::info!(
        socket = %socket_path,
        systemd_activated = activated,
        "server_listening"
    );

    axum::serve(listener, router(broker))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| StartupError {
            code: "ERR_SERVER_FAILED",
            message: err.to_string(),
        })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn remove_socket_if_exists(path: &str) -> Result<(), StartupError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => {
            if !meta.file_type().is_socket() {
                return Err(StartupError {
                    code: "ERR_SOCKET_PATH",
                    message: "socket path exists and is not a unix socket".to_string(),
                });
            }
            std::fs::remove_file(path).map_err(|err| StartupError {
                code: "ERR_SOCKET_PATH",
                message: format!("failed to remove stale socket: {err}"),
            })
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StartupError {
            code: "ERR_SOCKET_PATH",
            message: format!("failed to stat socket path: {err}"),
        }),
    }
}

/// Adopts fd 3 when `LISTEN_PID` matches this process and `LISTEN_FDS` is at
/// least one. The fd must be a Unix stream socket; anything else is a fatal
/// startup error rather than a silent fallback.
fn systemd_listener() -> Result<Option<StdUnixListener>, StartupError> {
    let pid_str = std::env::var("LISTEN_PID").unwrap_or_default();
    let fds_str = std::env::var("LISTEN_FDS").unwrap_or_default();
    if pid_str.is_empty() || fds_str.is_empty() {
        return Ok(None);
    }

    let pid: u32 = pid_str.parse().map_err(|_| StartupError {
        code: "ERR_SOCKET_ACTIVATION",
        message: format!("invalid LISTEN_PID {pid_str:?}"),
    })?;
    if pid != std::process::id() {
        return Ok(None);
    }

    let fd_count: i64 = fds_str.parse().map_err(|_| StartupError {
        code: "ERR_SOCKET_ACTIVATION",
        message: format!("invalid LISTEN_FDS {fds_str:?}"),
    })?;
    if fd_count <= 0 {
        return Ok(None);
    }

    let borrowed = unsafe { BorrowedFd::borrow_raw(SYSTEMD_LISTEN_FD) };
    let sock_type = nix::sys::socket::getsockopt(&borrowed, nix::sys::socket::sockopt::SockType)
        .map_err(|_| StartupError {
            code: "ERR_SOCKET_ACTIVATION",
            message: "systemd listener fd is not a socket".to_string(),
        })?;
    if sock_type != nix::sys::socket::SockType::Stream {
        return Err(StartupError {
            code: "ERR_SOCKET_ACTIVATION",
            message: "systemd listener is not a stream socket".to_string(),
        });
    }
    let listener = unsafe { StdUnixListener::from_raw_fd(SYSTEMD_LISTEN_FD) };
    listener.local_addr().map_err(|_| StartupError {
        code: "ERR_SOCKET_ACTIVATION",
        message: "systemd listener is not a unix socket".to_string(),
    })?;

    Ok(Some(listener))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_wire_contract() {
        assert_eq!(status_for_error(ErrorCode::BadRequest), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_error(ErrorCode::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(status_for_error(ErrorCode::UpstreamError), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for_error(ErrorCode::RedactionError),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn stale_socket_removal_refuses_regular_files() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("warden.sock");
        std::fs::write(&path, b"not a socket").expect("file should be written");
        let err = remove_socket_if_exists(path.to_string_lossy().as_ref()).unwrap_err();
        assert_eq!(err.code, "ERR_SOCKET_PATH");

        let missing = dir.path().join("missing.sock");
        remove_socket_if_exists(missing.to_string_lossy().as_ref())
            .expect("missing path should be fine");
    }
}
