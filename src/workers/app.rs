//! Application flow: wire the CLI to the transfer core.
//!
//! Drives the manual handshake (print a code, read the pasted reply),
//! then runs the session event loop: queued files go out through the
//! sequential send queue, finalized incoming files are written to the
//! output directory. The loop runs until Ctrl-C or the peer goes away.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::connection::PeerLink;
use crate::core::session::{
    run_send_queue, OutgoingTransfer, ReceivedFile, SessionEvent,
};
use crate::utils::abort::AbortFlag;
use crate::utils::clipboard::copy_to_clipboard;
use crate::workers::args::Args;

pub async fn run(args: Args, abort: AbortFlag) -> Result<()> {
    let out_dir = args.out.clone().unwrap_or_else(|| PathBuf::from("."));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    // ── Handshake ────────────────────────────────────────────────────────
    let link = if let Some(join) = &args.join {
        let offer_code = if join == "-" {
            prompt_code("Paste the offer code from your peer:").await?
        } else {
            join.clone()
        };
        let (link, answer_code) =
            PeerLink::join(&offer_code, events_tx.clone(), abort.clone()).await?;
        present_code("answer", &answer_code, !args.no_clipboard);
        link
    } else {
        let (link, offer_code) = PeerLink::initiate(events_tx.clone(), abort.clone()).await?;
        present_code("offer", &offer_code, !args.no_clipboard);
        let answer_code = prompt_code("Paste the answer code from your peer:").await?;
        link.apply_answer(&answer_code).await?;
        link
    };

    info!(event = "negotiating", "Waiting for the peer connection");
    link.wait_connected().await?;
    let channel = link.wait_channel_open().await?;
    eprintln!("Connected. Receiving into {}.", out_dir.display());

    // ── Outbound queue ───────────────────────────────────────────────────
    let (queue_tx, queue_rx) = mpsc::channel(64);
    for path in &args.send {
        match OutgoingTransfer::from_path(path.clone()) {
            Ok(transfer) => {
                info!(event = "file_queued", name = %transfer.name, bytes = transfer.size, "File queued for sending");
                if queue_tx.send(transfer).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(event = "queue_rejected", path = %path.display(), %e, "Skipping unsendable path");
                eprintln!("Skipping {}: {e}", path.display());
            }
        }
    }
    drop(queue_tx);

    let queue_task = tokio::spawn(run_send_queue(
        channel,
        queue_rx,
        events_tx.clone(),
        abort.clone(),
    ));

    // ── Event loop ───────────────────────────────────────────────────────
    loop {
        tokio::select! {
            _ = abort.aborted() => break,
            event = events_rx.recv() => match event {
                Some(event) => handle_event(event, &out_dir).await,
                None => break,
            },
        }
    }

    link.teardown().await;
    queue_task.abort();
    Ok(())
}

async fn handle_event(event: SessionEvent, out_dir: &Path) {
    match event {
        SessionEvent::Link(state) => info!(event = "link_state", %state, "Link state changed"),
        SessionEvent::ChannelOpen => info!(event = "channel_ready", "Data channel open"),
        SessionEvent::ChannelClosed => {
            warn!(event = "channel_gone", "Data channel closed");
            eprintln!("Peer channel closed.");
        }
        SessionEvent::SendProgress {
            name, done, total, ..
        } => {
            eprintln!("sending {name}: {done}/{total} bytes");
        }
        SessionEvent::SendComplete { name, .. } => {
            eprintln!("sent {name}");
        }
        SessionEvent::ReceiveProgress {
            name, done, total, ..
        } => {
            eprintln!("receiving {name}: {done}/{total} bytes");
        }
        SessionEvent::FileReceived(file) => {
            if let Err(e) = save_received(&file, out_dir).await {
                warn!(event = "save_failed", name = %file.name, %e, "Could not save received file");
                eprintln!("Failed to save {}: {e}", file.name);
            }
        }
        SessionEvent::Error(msg) => {
            warn!(event = "session_error", %msg, "Session error");
            eprintln!("Error: {msg}");
        }
    }
}

async fn save_received(file: &ReceivedFile, out_dir: &Path) -> Result<()> {
    let path = out_dir.join(sanitize_file_name(&file.name));
    tokio::fs::create_dir_all(out_dir).await?;
    tokio::fs::write(&path, &file.data)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(event = "file_saved", name = %file.name, path = %path.display(),
          bytes = file.data.len(), mime = %file.mime, "Received file saved");
    eprintln!("received {} ({} bytes) -> {}", file.name, file.data.len(), path.display());
    Ok(())
}

/// Reduce a sender-declared file name to a safe flat name.
///
/// - Takes the last path component (separators normalized first)
/// - Filters characters to alphanumeric, `.`, `-`, `_`, and space
/// - Returns "file" if the result would be empty or only dots
fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or("");

    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();

    if safe.is_empty() || safe.chars().all(|c| c == '.') {
        "file".into()
    } else {
        safe
    }
}

// ── Code exchange helpers ────────────────────────────────────────────────────

fn present_code(kind: &str, code: &str, use_clipboard: bool) {
    eprintln!("Your {kind} code (send it to your peer):");
    println!("{code}");
    if use_clipboard && copy_to_clipboard(code) {
        eprintln!("(copied to clipboard)");
    }
}

async fn prompt_code(prompt: &str) -> Result<String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("{prompt}");
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    bail!("stdin closed before a connection code was entered");
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories_and_traversal() {
        assert_eq!(sanitize_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("a\\b\\evil.exe"), "evil.exe");
        assert_eq!(sanitize_file_name("dir/sub/name.txt"), "name.txt");
    }

    #[test]
    fn sanitize_filters_hostile_characters() {
        assert_eq!(sanitize_file_name("we?ird*na:me.bin"), "weirdname.bin");
        assert_eq!(sanitize_file_name("..."), "file");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name("///"), "file");
    }
}
