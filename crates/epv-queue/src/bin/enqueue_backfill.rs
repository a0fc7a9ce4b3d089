//! One-shot backfill enqueuer: reads episode ids (one per line, optionally
//! `episode_id,force_video_chunking,force_video_quotes` CSV) from stdin and
//! sends a queue message per id. Not part of the orchestration engine — no
//! pipeline logic lives here, only message construction and `SendMessage`.

use std::io::{self, BufRead};

use epv_models::{EpisodeId, EpisodeMessage};
use epv_queue::QueueConsumer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let consumer = QueueConsumer::from_env()
        .await
        .map_err(|e| anyhow::anyhow!("failed to configure queue client: {}", e))?;

    let stdin = io::stdin();
    let mut enqueued = 0u64;
    let mut failed = 0u64;

    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let message = parse_line(line);
        match consumer.enqueue(&message).await {
            Ok(()) => {
                enqueued += 1;
                println!("enqueued {}", message.episode_id);
            }
            Err(e) => {
                failed += 1;
                eprintln!("failed to enqueue {}: {}", message.episode_id, e);
            }
        }
    }

    println!("done: {enqueued} enqueued, {failed} failed");
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn parse_line(line: &str) -> EpisodeMessage {
    let mut fields = line.split(',').map(str::trim);
    let episode_id = EpisodeId::from(fields.next().unwrap_or_default().to_string());
    let force_video_chunking = fields.next().map(is_truthy).unwrap_or(false);
    let force_video_quotes = fields.next().map(is_truthy).unwrap_or(false);

    EpisodeMessage {
        episode_id,
        force_video_chunking,
        force_video_quotes,
    }
}

fn is_truthy(field: &str) -> bool {
    matches!(field.to_ascii_lowercase().as_str(), "true" | "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_episode_id_has_no_force_flags() {
        let msg = parse_line("ep-123");
        assert_eq!(msg.episode_id.as_str(), "ep-123");
        assert!(!msg.force_video_chunking);
        assert!(!msg.force_video_quotes);
    }

    #[test]
    fn csv_row_sets_force_flags() {
        let msg = parse_line("ep-123, true, 1");
        assert_eq!(msg.episode_id.as_str(), "ep-123");
        assert!(msg.force_video_chunking);
        assert!(msg.force_video_quotes);
    }
}
