//! Parent/child handoff through a fence
//!
//! The child does some "work" and triggers; the parent blocks until then.
//!
//! Usage:
//! ```bash
//! cargo run --example fork
//! ```

use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};
use shmfence::{allocate, Fence};
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let handle = allocate()?;
    println!("Allocated fence storage");

    match unsafe { fork() }? {
        ForkResult::Child => {
            let fence = Fence::map(handle)?;
            thread::sleep(Duration::from_millis(500));
            println!("[child] work done, triggering");
            fence.trigger()?;
            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            let fence = Fence::map(handle)?;
            println!("[parent] waiting for child {}", child);
            fence.wait()?;
            println!("[parent] fence triggered: {}", fence.query());

            waitpid(child, None)?;
        }
    }

    Ok(())
}
