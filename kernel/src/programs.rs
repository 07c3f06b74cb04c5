//! Built-in Images
//!
//! Small programs for the daemon and for exercising the kernel:
//!
//! | Image              | Behaviour                                        |
//! |--------------------|--------------------------------------------------|
//! | `bin/idle`         | handshakes, then answers heartbeats forever      |
//! | `bin/exit`         | exits with the code in its first argument        |
//! | `bin/crash`        | fails right after the handshake                  |
//! | `bin/hang`         | handshakes, then stops responding                |
//! | `bin/mute`         | never answers INIT                               |
//! | `bin/bad-init`     | answers INIT with the wrong syscall              |
//! | `bin/garbage`      | sends an undecodable frame, then idles           |
//! | `bin/forker`       | forks once, then idles in both parent and child  |
//! | `bin/orphan-watch` | exits with its new ppid once reparented          |
//! | `bin/exec`         | execs the image named in its first argument      |

use crate::exec::{ImageStore, UnitPort};
use crate::runtime::{ProcessRuntime, RuntimeEvent};
use crate::sys::message::{KernelMessage, ProcessMessage};
use crate::sys::syscall::Syscall;
use crate::{KernelError, KernelResult};
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

/// How long a fresh process waits to learn it is a forked child
pub const FORK_PROBE: Duration = Duration::from_millis(50);

/// Exit code used when `bin/exec` cannot exec
pub const EXEC_FAILED: i32 = 127;

/// Image store with every built-in program
pub fn builtin() -> ImageStore {
    let mut images = ImageStore::new();
    images.register("bin/idle", idle);
    images.register("bin/exit", exit);
    images.register("bin/crash", crash);
    images.register("bin/hang", hang);
    images.register("bin/mute", mute);
    images.register("bin/bad-init", bad_init);
    images.register("bin/garbage", garbage);
    images.register("bin/forker", forker);
    images.register("bin/orphan-watch", orphan_watch);
    images.register("bin/exec", exec);
    images
}

async fn idle(port: UnitPort) -> KernelResult<()> {
    let mut rt = ProcessRuntime::init(port).await?;
    rt.serve().await
}

async fn exit(port: UnitPort) -> KernelResult<()> {
    let rt = ProcessRuntime::init(port).await?;
    let code = match rt.args().first() {
        Some(arg) => arg
            .parse()
            .map_err(|_| KernelError::ExecutionFault(format!("bad exit code {:?}", arg)))?,
        None => 0,
    };
    rt.exit(code)
}

async fn crash(port: UnitPort) -> KernelResult<()> {
    let rt = ProcessRuntime::init(port).await?;
    Err(KernelError::ExecutionFault(format!("pid {} crashed", rt.pid())))
}

async fn hang(port: UnitPort) -> KernelResult<()> {
    let _rt = ProcessRuntime::init(port).await?;
    std::future::pending().await
}

async fn mute(port: UnitPort) -> KernelResult<()> {
    let _port = port;
    std::future::pending().await
}

async fn bad_init(mut port: UnitPort) -> KernelResult<()> {
    let frame = port.recv().await.ok_or(KernelError::ThreadTerminated)?;
    let init = KernelMessage::decode(&frame)?;
    port.send(ProcessMessage::bare(init.identifier, Syscall::Heartbeat).encode()?)?;
    std::future::pending().await
}

async fn garbage(port: UnitPort) -> KernelResult<()> {
    let mut rt = ProcessRuntime::init(port).await?;
    rt.send_raw(Bytes::from_static(b"\xffnot an envelope"))?;
    // Valid JSON, unknown syscall
    rt.send_raw(Bytes::from_static(
        br#"{"identifier":{"origin":"process","seq":0},"call":42,"data":null}"#,
    ))?;
    rt.serve().await
}

async fn forker(port: UnitPort) -> KernelResult<()> {
    let mut rt = ProcessRuntime::init(port).await?;

    match rt.wait_event(FORK_PROBE).await? {
        Some(RuntimeEvent::Forked { .. }) => {
            debug!("Pid {} is a forked child of {}", rt.pid(), rt.ppid());
        }
        _ => {
            let child = rt.fork().await?;
            debug!("Pid {} forked {}", rt.pid(), child);
        }
    }
    rt.serve().await
}

async fn orphan_watch(port: UnitPort) -> KernelResult<()> {
    let mut rt = ProcessRuntime::init(port).await?;
    loop {
        if let RuntimeEvent::Reparented { ppid } = rt.next_event().await? {
            let code = i32::try_from(ppid).unwrap_or(i32::MAX);
            return rt.exit(code);
        }
    }
}

async fn exec(port: UnitPort) -> KernelResult<()> {
    let mut rt = ProcessRuntime::init(port).await?;
    let target = rt.args().first().cloned().unwrap_or_else(|| "bin/idle".into());
    let args = rt.args().get(1..).map(<[String]>::to_vec);

    match rt.exec(&target, args).await {
        Err(KernelError::SyscallFailed(code)) => {
            debug!("Pid {} could not exec {}: {:?}", rt.pid(), target, code);
            rt.exit(EXEC_FAILED)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_images() {
        let images = builtin();
        for uri in [
            "bin/idle", "bin/exit", "bin/crash", "bin/hang", "bin/mute", "bin/bad-init",
            "bin/garbage", "bin/forker", "bin/orphan-watch", "bin/exec",
        ] {
            assert!(images.contains(uri), "missing {}", uri);
        }
        assert_eq!(images.uris().len(), 10);
    }
}
