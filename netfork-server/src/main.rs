mod args;
mod image;
mod pe;
mod proc;
mod vm;

use std::{process, slice};

use clap::Parser;
use netfork_common::{
    anyhow::{Context, Result},
    ntapi::ntpebteb::{PEB, TEB},
    tracing::{error, info},
    transport::Server,
    winapi::um::{
        processthreadsapi::{GetExitCodeProcess, ResumeThread},
        synchapi::WaitForSingleObject,
        winbase::INFINITE,
        winnt::CONTEXT,
    },
};

use crate::args::Args;

fn main() {
    netfork_common::tracing::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        error!("netfork server failed: {e:#}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let server = Server::listen(([0u8; 4], args.port).into())?;
    info!("listening on port {}", server.port());

    let mut client = server.accept_single()?;
    info!("accepted client {}", client.peer_addr());

    let thread_context: CONTEXT = client
        .recv_value()
        .context("failed to receive thread context")?;
    let forked_peb: PEB = client
        .recv_value()
        .context("failed to receive process environment block")?;
    // The TEB snapshot is consumed to keep the stream aligned; nothing from
    // it is re-injected, the loader builds the initial thread's own.
    let _forked_teb: TEB = client
        .recv_value()
        .context("failed to receive thread environment block")?;
    let size_of_image: u32 = client.recv_value().context("failed to receive image size")?;

    let mut image_path = image::expand_image_path()?;
    let image_file = image::create_temporary_image(size_of_image, &mut image_path)?;

    {
        let image_view = image::create_image_view(image_file.as_raw(), size_of_image)?;

        let view_bytes = unsafe {
            slice::from_raw_parts_mut(image_view.view.as_ptr() as *mut u8, size_of_image as usize)
        };
        client
            .recv_exact(view_bytes)
            .context("failed to receive image bytes")?;
        info!("received {size_of_image:#x} image bytes");

        unsafe {
            pe::patch_image_for_execution(
                image_view.view.as_ptr(),
                forked_peb.ImageBaseAddress as u64,
            )
            .context("failed to patch image for execution")?;
        }
        // The view and mapping close here; the section is created from the
        // file handle alone.
    }

    let forked_process =
        proc::create_forked_process(image_file.as_raw()).context("failed to create forked process")?;

    vm::rebuild_forked_process(forked_process.as_raw(), &mut client)
        .context("failed to rebuild forked process")?;

    let forked_thread = proc::create_forked_thread(forked_process.as_raw(), &thread_context)
        .context("failed to create forked thread")?;

    unsafe {
        ResumeThread(forked_thread.as_raw());
        WaitForSingleObject(forked_process.as_raw(), INFINITE);

        let mut exit_code = 0u32;
        if GetExitCodeProcess(forked_process.as_raw(), &mut exit_code) != 0 {
            info!("child exited with code {exit_code}");
        }
    }

    // Detach: closing the server must not tear the running child down.
    forked_process.detach();

    Ok(())
}
