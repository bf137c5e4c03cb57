//! Local IPC endpoint for hook connections: a Unix-domain socket on POSIX
//! hosts, a named pipe on Windows. Each accepted connection carries exactly
//! one newline-terminated JSON frame; permission requests keep the
//! connection open until the coordinator answers, notifications are closed
//! immediately.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::protocol::{self, Frame, FrameError};
use crate::state::HookWriter;

/// How long a freshly accepted connection gets to deliver its frame.
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the startup liveness probe waits for a competing daemon.
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

pub type HookReader = Box<dyn AsyncRead + Send + Unpin>;

/// A hook connection after handoff: transport-erased halves the coordinator
/// owns until resolution.
pub struct HookConn {
    pub reader: HookReader,
    pub writer: HookWriter,
}

pub struct IpcServer {
    path: PathBuf,
    ignored_notification_types: HashSet<String>,
    #[cfg(unix)]
    listener: Option<tokio::net::UnixListener>,
}

impl IpcServer {
    pub fn new(path: PathBuf, ignored_notification_types: HashSet<String>) -> Self {
        Self {
            path,
            ignored_notification_types,
            #[cfg(unix)]
            listener: None,
        }
    }

    /// Create the endpoint. Unusable endpoints are fatal: without the
    /// socket there is nothing for hooks to talk to.
    #[cfg(unix)]
    pub async fn bind(&mut self) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if self.path.exists() {
            // Probe before unlinking: a connect that succeeds means a live
            // daemon owns this endpoint.
            let probe =
                tokio::time::timeout(PROBE_TIMEOUT, tokio::net::UnixStream::connect(&self.path))
                    .await;
            if matches!(probe, Ok(Ok(_))) {
                anyhow::bail!(
                    "another daemon is already listening on {}",
                    self.path.display()
                );
            }
            info!(path = %self.path.display(), "Removing stale socket");
            std::fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove stale socket {}", self.path.display()))?;
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
        }

        let listener = tokio::net::UnixListener::bind(&self.path)
            .with_context(|| format!("failed to bind socket {}", self.path.display()))?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", self.path.display()))?;

        info!(path = %self.path.display(), "Listening for hook connections");
        self.listener = Some(listener);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn run(&self, coordinator: Coordinator) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .context("IPC server run before bind")?;
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let coordinator = coordinator.clone();
                    let ignored = self.ignored_notification_types.clone();
                    tokio::spawn(async move {
                        let (reader, writer) = stream.into_split();
                        handle_connection(Box::new(reader), Box::new(writer), ignored, coordinator)
                            .await;
                    });
                }
                Err(err) => warn!("Failed to accept hook connection: {}", err),
            }
        }
    }

    #[cfg(windows)]
    pub async fn bind(&mut self) -> Result<()> {
        // Named pipe instances are created per connection in run(); creating
        // the first instance here surfaces an unusable endpoint at startup.
        let name = self.path.to_string_lossy();
        let server = windows_pipe::create_owner_only(&name)
            .with_context(|| format!("failed to create named pipe {name}"))?;
        drop(server);
        info!(pipe = %name, "Named pipe endpoint available");
        Ok(())
    }

    #[cfg(windows)]
    pub async fn run(&self, coordinator: Coordinator) -> Result<()> {
        let name = self.path.to_string_lossy().to_string();
        let mut server = windows_pipe::create_owner_only(&name)
            .with_context(|| format!("failed to create named pipe {name}"))?;
        info!(pipe = %name, "Listening for hook connections");
        loop {
            server
                .connect()
                .await
                .context("named pipe connect failed")?;
            let connected = std::mem::replace(
                &mut server,
                windows_pipe::create_owner_only(&name)
                    .with_context(|| format!("failed to recreate named pipe {name}"))?,
            );
            let coordinator = coordinator.clone();
            let ignored = self.ignored_notification_types.clone();
            tokio::spawn(async move {
                let (reader, writer) = tokio::io::split(connected);
                handle_connection(Box::new(reader), Box::new(writer), ignored, coordinator).await;
            });
        }
    }

    /// Remove the endpoint file at shutdown.
    pub fn cleanup(&self) {
        #[cfg(unix)]
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Read one frame, classify it, and hand it off. Malformed frames close the
/// connection with no response; the hook's own timeout covers the rest.
pub(crate) async fn handle_connection(
    reader: HookReader,
    writer: HookWriter,
    ignored_notification_types: HashSet<String>,
    coordinator: Coordinator,
) {
    let mut reader = BufReader::new(reader);
    let frame = match read_frame(&mut reader).await {
        Ok(frame) => frame,
        Err(err) => {
            warn!("Dropping hook connection: {:#}", err);
            return;
        }
    };

    match frame {
        Frame::Notification(notification) => {
            if ignored_notification_types.contains(&notification.notification_type) {
                debug!(
                    notification_type = %notification.notification_type,
                    "Dropping filtered notification"
                );
                return;
            }
            coordinator.handle_notification(notification).await;
        }
        Frame::Permission(request) => {
            let conn = HookConn {
                reader: Box::new(reader),
                writer,
            };
            coordinator.handle_permission_request(request, conn).await;
        }
    }
}

async fn read_frame(reader: &mut BufReader<HookReader>) -> Result<Frame> {
    use tokio::io::AsyncBufReadExt;

    let mut line = String::new();
    let read = tokio::time::timeout(FRAME_READ_TIMEOUT, async {
        // The +1 byte distinguishes an oversized frame from one that ends
        // exactly at the cap.
        let mut limited = reader.take((protocol::MAX_FRAME_BYTES + 1) as u64);
        limited.read_line(&mut line).await
    })
    .await
    .context("timed out waiting for request frame")?
    .context("failed to read request frame")?;

    if read == 0 {
        return Err(FrameError::Truncated.into());
    }
    if line.len() > protocol::MAX_FRAME_BYTES {
        return Err(FrameError::Oversized.into());
    }
    Ok(protocol::parse_frame(line.trim())?)
}

#[cfg(windows)]
mod windows_pipe {
    //! Named pipe instances restricted to the current user, mirroring the
    //! 0600 mode of the Unix socket.

    use std::ffi::c_void;
    use std::io;
    use std::ptr;

    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
    use windows_sys::Win32::Foundation::{CloseHandle, LocalFree, HANDLE};
    use windows_sys::Win32::Security::Authorization::{
        ConvertSidToStringSidW, ConvertStringSecurityDescriptorToSecurityDescriptorW,
    };
    use windows_sys::Win32::Security::{
        GetTokenInformation, TokenUser, SECURITY_ATTRIBUTES, TOKEN_QUERY, TOKEN_USER,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    /// String SID of the user this process runs as.
    fn current_user_sid() -> io::Result<String> {
        unsafe {
            let mut token: HANDLE = ptr::null_mut();
            if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
                return Err(io::Error::last_os_error());
            }

            let mut len = 0u32;
            GetTokenInformation(token, TokenUser, ptr::null_mut(), 0, &mut len);
            if len == 0 {
                CloseHandle(token);
                return Err(io::Error::last_os_error());
            }
            let mut buf = vec![0u8; len as usize];
            let ok =
                GetTokenInformation(token, TokenUser, buf.as_mut_ptr() as *mut c_void, len, &mut len);
            CloseHandle(token);
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }

            let token_user = buf.as_ptr() as *const TOKEN_USER;
            let mut sid_ptr: *mut u16 = ptr::null_mut();
            if ConvertSidToStringSidW((*token_user).User.Sid, &mut sid_ptr) == 0
                || sid_ptr.is_null()
            {
                return Err(io::Error::last_os_error());
            }
            let mut wide_len = 0;
            while *sid_ptr.add(wide_len) != 0 {
                wide_len += 1;
            }
            let sid = String::from_utf16_lossy(std::slice::from_raw_parts(sid_ptr, wide_len));
            LocalFree(sid_ptr as *mut c_void);
            Ok(sid)
        }
    }

    pub fn create_owner_only(name: &str) -> io::Result<NamedPipeServer> {
        let sid = current_user_sid()?;
        // Protected DACL granting generic-all to the owning user only.
        let sddl = format!("D:P(A;;GA;;;{sid})");
        let sddl_wide: Vec<u16> = sddl.encode_utf16().chain(std::iter::once(0)).collect();

        unsafe {
            let mut descriptor: *mut c_void = ptr::null_mut();
            let ok = ConvertStringSecurityDescriptorToSecurityDescriptorW(
                sddl_wide.as_ptr(),
                1,
                &mut descriptor as *mut *mut c_void as *mut _,
                ptr::null_mut(),
            );
            if ok == 0 || descriptor.is_null() {
                return Err(io::Error::last_os_error());
            }

            let mut attributes = SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: descriptor,
                bInheritHandle: 0,
            };

            let result = ServerOptions::new()
                .reject_remote_clients(true)
                .create_with_security_attributes_raw(
                    name,
                    &mut attributes as *mut _ as *mut c_void,
                );
            LocalFree(descriptor);
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn frame_from(raw: &str) -> Result<Frame> {
        let (client, server) = tokio::io::duplex(protocol::MAX_FRAME_BYTES * 2);
        let mut reader = BufReader::new(Box::new(server) as HookReader);
        let write = async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client.write_all(raw.as_bytes()).await.unwrap();
            client.shutdown().await.unwrap();
        };
        let (frame, _) = tokio::join!(read_frame(&mut reader), write);
        frame
    }

    #[tokio::test]
    async fn reads_a_single_newline_terminated_frame() {
        let frame = frame_from("{\"tool_name\":\"Bash\",\"tool_input\":{\"command\":\"ls\"}}\n")
            .await
            .expect("frame parses");
        assert!(matches!(frame, Frame::Permission(_)));
    }

    #[tokio::test]
    async fn frame_without_trailing_newline_still_parses_at_eof() {
        let frame = frame_from("{\"tool_name\":\"Bash\"}")
            .await
            .expect("frame parses");
        assert!(matches!(frame, Frame::Permission(_)));
    }

    #[tokio::test]
    async fn empty_connection_is_truncated() {
        let err = frame_from("").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FrameError>(),
            Some(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let huge = format!(
            "{{\"tool_name\":\"Bash\",\"tool_input\":{{\"command\":\"{}\"}}}}\n",
            "x".repeat(protocol::MAX_FRAME_BYTES)
        );
        let err = frame_from(&huge).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FrameError>(),
            Some(FrameError::Oversized)
        ));
    }

    #[tokio::test]
    async fn garbage_is_a_json_error() {
        let err = frame_from("hello world\n").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FrameError>(),
            Some(FrameError::Json(_))
        ));
    }
}
