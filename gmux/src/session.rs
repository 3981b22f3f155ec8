//! Guest sessions over the Unix-socket endpoint.
//!
//! Each connected guest front-end gets one session thread owning one
//! `Context`. The transport is the 16-byte command record; replies are
//! posted only for commands that produce one (INIT, reads, BAR4 calls).
//! A closed or broken socket tears the context down, releasing the guest
//! slot and unregistering it from the scheduler.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::command::{Command, RECORD_SIZE};
use crate::context::Context;
use crate::device::DeviceRef;
use crate::sched::Scheduler;
use crate::Result;

pub struct Server {
    device: DeviceRef,
    sched: Arc<dyn Scheduler>,
    listener: UnixListener,
}

impl Server {
    pub fn bind(device: DeviceRef, sched: Arc<dyn Scheduler>, endpoint: &str) -> Result<Server> {
        let _ = std::fs::remove_file(endpoint);
        let listener = UnixListener::bind(endpoint)?;
        info!("listening on {}", endpoint);
        Ok(Server {
            device,
            sched,
            listener,
        })
    }

    /// Accept sessions forever; one thread per guest.
    pub fn run(&self) -> Result<()> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let device = self.device.clone();
                    let sched = self.sched.clone();
                    let through = self.device.config().through;
                    std::thread::spawn(move || {
                        session_main(stream, device, sched, through);
                    });
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                }
            }
        }
        Ok(())
    }
}

fn session_main(
    mut stream: UnixStream,
    device: DeviceRef,
    sched: Arc<dyn Scheduler>,
    through: bool,
) {
    debug!("session start");
    let mut ctx = Context::new(device, sched, through);
    let mut raw = [0u8; RECORD_SIZE];
    loop {
        if let Err(e) = stream.read_exact(&mut raw) {
            debug!("session closed: {}", e);
            return;
        }
        let cmd = match Command::decode(&raw) {
            Ok(cmd) => cmd,
            Err(_) => {
                warn!("malformed record, closing session");
                return;
            }
        };
        if ctx.handle(&cmd) {
            let reply = cmd.reply(ctx.reply()).encode();
            if let Err(e) = stream.write_all(&reply) {
                debug!("session closed: {}", e);
                return;
            }
        }
    }
}
