use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.examguard.Proctor1",
    default_service = "org.examguard.Proctor1",
    default_path = "/org/examguard/Proctor1"
)]
trait Proctor {
    fn enroll(&self, user: &str, media: &str) -> zbus::Result<(bool, u32)>;
    fn train(&self) -> zbus::Result<bool>;
    fn verify(&self, user: &str, frame: &str) -> zbus::Result<String>;
    fn identify(&self, frame: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "examguard", about = "Exam proctoring face verification CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add face samples for a user from a photo or short video
    Enroll {
        #[arg(short, long)]
        user: String,
        /// Image or video file
        file: PathBuf,
    },
    /// Retrain the classifier from all stored samples
    Train,
    /// Check a frame against the expected user
    Verify {
        #[arg(short, long)]
        user: String,
        /// Webcam frame (any common image format)
        file: PathBuf,
        /// Write the annotated preview JPEG here
        #[arg(long)]
        preview: Option<PathBuf>,
    },
    /// Find out who is in a frame
    Identify {
        file: PathBuf,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = ProctorProxy::new(&connection)
        .await
        .context("examguardd is not reachable")?;

    match cli.command {
        Commands::Enroll { user, file } => {
            let media = encode_file(&file)?;
            let (accepted, count) = proxy.enroll(&user, &media).await?;
            if accepted {
                println!("{user}: {count} samples stored, model trained");
            } else {
                println!("{user}: {count} samples stored, model not trained yet");
            }
        }
        Commands::Train => {
            if proxy.train().await? {
                println!("model trained");
            } else {
                bail!("training failed; see examguardd logs");
            }
        }
        Commands::Verify { user, file, preview } => {
            let frame = encode_file(&file)?;
            let report: serde_json::Value = serde_json::from_str(&proxy.verify(&user, &frame).await?)?;
            if let Some(error) = report.get("error").and_then(|e| e.as_str()) {
                bail!("verify failed: {error}");
            }
            if let Some(out) = preview {
                write_preview(&report, &out)?;
                tracing::info!(path = %out.display(), "preview written");
            }
            println!("status: {}", report["status"].as_str().unwrap_or("unknown"));
            if let Some(boxes) = report["boxes"].as_array() {
                for b in boxes {
                    println!(
                        "  {} at ({}, {}) {}x{} distance {}",
                        b["label"].as_str().unwrap_or("?"),
                        b["x"],
                        b["y"],
                        b["w"],
                        b["h"],
                        b["confidence"]
                    );
                }
            }
        }
        Commands::Identify { file } => {
            let frame = encode_file(&file)?;
            let report: serde_json::Value = serde_json::from_str(&proxy.identify(&frame).await?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn encode_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(STANDARD.encode(bytes))
}

/// Decode the report's `preview` data URI into `out`.
fn write_preview(report: &serde_json::Value, out: &Path) -> Result<()> {
    let uri = report["preview"].as_str().unwrap_or_default();
    let payload = uri.split_once(',').map(|(_, data)| data).unwrap_or(uri);
    if payload.is_empty() {
        bail!("daemon returned no preview");
    }
    let jpeg = STANDARD.decode(payload).context("preview is not valid base64")?;
    std::fs::write(out, jpeg).with_context(|| format!("failed to write {}", out.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.jpg");
        std::fs::write(&path, [0xffu8, 0xd8, 0xff]).unwrap();
        assert_eq!(encode_file(&path).unwrap(), "/9j/");
    }

    #[test]
    fn test_encode_missing_file() {
        assert!(encode_file(Path::new("/nonexistent/frame.jpg")).is_err());
    }

    #[test]
    fn test_write_preview_strips_data_uri() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("preview.jpg");
        let report = serde_json::json!({ "preview": "data:image/jpeg;base64,/9j/" });
        write_preview(&report, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), vec![0xff, 0xd8, 0xff]);
    }

    #[test]
    fn test_write_preview_missing() {
        let dir = tempfile::tempdir().unwrap();
        let report = serde_json::json!({ "status": "warning" });
        assert!(write_preview(&report, &dir.path().join("p.jpg")).is_err());
    }

    #[test]
    fn test_cli_parses_verify() {
        let cli = Cli::try_parse_from([
            "examguard", "verify", "--user", "alice", "frame.jpg", "--preview", "out.jpg",
        ])
        .unwrap();
        match cli.command {
            Commands::Verify { user, file, preview } => {
                assert_eq!(user, "alice");
                assert_eq!(file, PathBuf::from("frame.jpg"));
                assert_eq!(preview, Some(PathBuf::from("out.jpg")));
            }
            _ => panic!("expected verify"),
        }
    }
}
