use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};

use crate::system::SystemHandle;

/// What should we do when the user stops this program?
///
/// SIGINT and SIGTERM ask the system to shut down cleanly; SIGHUP makes the
/// writer reconnect, picking up DNS changes.
pub fn handle_signals(
    system: SystemHandle,
    rt_handle: tokio::runtime::Handle,
) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGHUP => {
                    log::info!("Received SIGHUP; reconnecting to the collector");
                    let system = system.clone();
                    rt_handle.spawn(async move { system.reconnect().await });
                }
                _ => {
                    log::info!("Received signal {signal}; shutting down");
                    system.shutdown();
                }
            }
        }
    });
    Ok(())
}
