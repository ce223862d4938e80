//! Action routing.
//!
//! An action path `<device>/<command>/<argument>` is resolved either to a
//! configured device or to the built-in `SERVER` pseudo-device. Device work
//! blocks on hardware I/O, so it runs on tokio's blocking pool; one slow
//! device never stalls the runtime or requests to other devices.
//!
//! `SERVER` commands:
//!
//! | command | argument | reply |
//! |---------|----------|-------|
//! | `get_log_level` | | current level number |
//! | `set_log_level` | level number | new level number |
//! | `open_dev` | device name | empty, device opened for this connection |
//! | `usleep` | microseconds | the argument, after sleeping |
//! | `repeat` | text | the text |
//! | `list` | | device names, one per line |
//! | `info` | device name | device description |
//! | `ping` | | empty |
//! | `get_time` | | Unix time in seconds, microsecond resolution |

use crate::config_file::SERVER_DEVICE;
use crate::device::{ConnectionId, DeviceHandle};
use crate::error::{AppResult, DispatchError};
use crate::registry::DeviceRegistry;
use crate::tracing_setup::LogControl;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Components of an action path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionPath<'a> {
    /// Device name, or `SERVER`
    pub device: &'a str,
    /// Command name
    pub command: &'a str,
    /// Everything after the second separator, may contain `/`
    pub argument: &'a str,
}

/// Split an action path into device, command and argument.
///
/// One leading `/` is ignored. Missing parts are empty.
pub fn parse_url(path: &str) -> ActionPath<'_> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let mut parts = path.splitn(3, '/');
    ActionPath {
        device: parts.next().unwrap_or_default(),
        command: parts.next().unwrap_or_default(),
        argument: parts.next().unwrap_or_default(),
    }
}

/// Routes actions to devices on behalf of connections.
#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    registry: Arc<DeviceRegistry>,
    log: LogControl,
}

impl ActionDispatcher {
    /// Dispatcher over `registry`, reporting and changing levels through `log`.
    pub fn new(registry: Arc<DeviceRegistry>, log: LogControl) -> Self {
        Self { registry, log }
    }

    /// The device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Run one action for connection `conn`.
    pub async fn run(&self, path: &str, conn: ConnectionId) -> AppResult<String> {
        let action = parse_url(path);
        debug!(
            conn,
            device = action.device,
            command = action.command,
            argument = action.argument,
            "Action"
        );
        if action.device.is_empty() {
            return Err(DispatchError::EmptyDevice);
        }
        if action.device == SERVER_DEVICE {
            return self.server_command(action.command, action.argument, conn).await;
        }
        let device = self.lookup(action.device).await?;
        let command = action.command.to_string();
        let argument = action.argument.to_string();
        let answer = tokio::task::spawn_blocking(move || {
            device.use_by(conn)?;
            device.command(&command, &argument)
        })
        .await??;
        Ok(answer)
    }

    /// Release every device held by a closed connection.
    ///
    /// Close failures are logged and otherwise ignored.
    pub async fn conn_close(&self, conn: ConnectionId) {
        let snapshot = self.registry.snapshot().await;
        let result = tokio::task::spawn_blocking(move || {
            for device in snapshot.devices() {
                if let Err(e) = device.release(conn) {
                    warn!(device = device.name(), conn, "Failed to close device: {}", e);
                }
            }
        })
        .await;
        if let Err(e) = result {
            warn!(conn, "Connection cleanup failed: {}", e);
        }
    }

    async fn lookup(&self, name: &str) -> AppResult<DeviceHandle> {
        self.registry
            .lookup(name)
            .await
            .ok_or_else(|| DispatchError::UnknownDevice(name.to_string()))
    }

    async fn server_command(&self, cmd: &str, arg: &str, conn: ConnectionId) -> AppResult<String> {
        match cmd {
            "get_log_level" => Ok(self.log.level().to_string()),
            "set_log_level" => {
                let level: i32 = parse_arg(cmd, arg)?;
                self.log.set_level(level).map_err(DispatchError::Logging)?;
                Ok(level.to_string())
            }
            "open_dev" => {
                let device = self.lookup(arg).await?;
                tokio::task::spawn_blocking(move || device.use_by(conn)).await??;
                Ok(String::new())
            }
            "usleep" => {
                let micros: u64 = parse_arg(cmd, arg)?;
                tokio::time::sleep(Duration::from_micros(micros)).await;
                Ok(micros.to_string())
            }
            "repeat" => Ok(arg.to_string()),
            "list" => Ok(self.registry.device_names().await.join("\n")),
            "info" => {
                let device = self.lookup(arg).await?;
                Ok(tokio::task::spawn_blocking(move || device.describe(conn)).await?)
            }
            "ping" => Ok(String::new()),
            "get_time" => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                Ok(format!("{}.{:06}", now.as_secs(), now.subsec_micros()))
            }
            _ => Err(DispatchError::UnknownServerCommand(cmd.to_string())),
        }
    }
}

fn parse_arg<T: std::str::FromStr>(command: &str, value: &str) -> AppResult<T> {
    value.trim().parse().map_err(|_| DispatchError::BadArgument {
        command: command.to_string(),
        value: value.to_string(),
    })
}
