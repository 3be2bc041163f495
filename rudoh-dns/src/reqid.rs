//! Random request-ID source
//!
//! Upstream queries get freshly generated 16-bit IDs so that two clients
//! picking the same ID cannot be confused with each other. IDs come from
//! the operating system's random source, through a buffered channel so the
//! hot path never blocks on it.

use std::sync::OnceLock;

use rand::rngs::OsRng;
use rand::TryRngCore;
use tokio::sync::{mpsc, Mutex};

/// How many IDs to keep buffered ahead of demand.
const ID_BUFFER: usize = 100;

static IDS: OnceLock<Mutex<mpsc::Receiver<u16>>> = OnceLock::new();

fn ids() -> &'static Mutex<mpsc::Receiver<u16>> {
    IDS.get_or_init(|| {
        let (tx, rx) = mpsc::channel(ID_BUFFER);

        // A dedicated producer thread keeps the buffer topped up for the
        // whole life of the process. It is the only path to IDs, so a
        // failing random source takes the process down.
        std::thread::spawn(move || loop {
            let id = match OsRng.try_next_u32() {
                Ok(value) => value as u16,
                Err(e) => {
                    tracing::error!(error = %e, "system random source failed");
                    std::process::abort();
                }
            };
            if tx.blocking_send(id).is_err() {
                break;
            }
        });

        Mutex::new(rx)
    })
}

/// Take the next random request ID.
pub async fn next_id() -> u16 {
    ids()
        .lock()
        .await
        .recv()
        .await
        .expect("request id producer terminated")
}
