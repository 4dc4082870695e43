use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::Camera;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn start_camera(&self) -> zbus::Result<bool>;
    async fn stop_camera(&self) -> zbus::Result<bool>;
    async fn capture_and_mark(&self) -> zbus::Result<String>;
    async fn recent_marks(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn enroll(
        &self,
        student_id: &str,
        display_name: &str,
        index_number: &str,
        image_path: &str,
        image_url: &str,
    ) -> zbus::Result<String>;
    async fn set_attendance(
        &self,
        student_id: &str,
        date: &str,
        status: &str,
        remarks: &str,
    ) -> zbus::Result<bool>;
    async fn attendance(&self, date: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the camera and start a capture session
    Start,
    /// Stop the capture session and release the camera
    Stop,
    /// Capture a frame and mark the recognized student present
    Mark,
    /// Show daemon status
    Status,
    /// Names marked during the current session
    Recent,
    /// Enroll a student's face from an image file
    Enroll {
        /// Student identifier
        #[arg(short, long)]
        student: String,
        /// Display name (defaults to the student id)
        #[arg(short, long, default_value = "")]
        name: String,
        /// Index number
        #[arg(short, long, default_value = "")]
        index: String,
        /// Face image to extract the embedding from
        image: PathBuf,
        /// Where the enrollment image is published, if anywhere
        #[arg(long, default_value = "")]
        image_url: String,
    },
    /// Manually set a student's attendance
    Set {
        /// Student identifier
        student: String,
        /// present, absent, late or excused
        status: String,
        /// Date as YYYY-MM-DD (defaults to today, UTC)
        #[arg(short, long, default_value = "")]
        date: String,
        #[arg(short, long, default_value = "")]
        remarks: String,
    },
    /// List attendance for a date, newest first
    Attendance {
        /// Date as YYYY-MM-DD (defaults to today, UTC)
        #[arg(default_value = "")]
        date: String,
    },
    /// List V4L2 capture devices
    Devices,
    /// Capture one still directly from a camera (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
            return Ok(());
        }
        Commands::Test { device } => {
            tracing::debug!(device = %device, "capturing a test still");
            let frame = tokio::task::spawn_blocking(move || -> Result<_> {
                let camera = Camera::open(&device, 640, 480)?;
                camera.warm_up(4)?;
                Ok(camera.capture_still(5)?)
            })
            .await??;
            println!(
                "Captured {}x{} frame #{} (avg brightness {:.1})",
                frame.width(),
                frame.height(),
                frame.sequence,
                frame.avg_brightness()
            );
            return Ok(());
        }
        _ => {}
    }

    tracing::debug!(system_bus = cli.system, "connecting to rollcalld");
    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Start => {
            if proxy.start_camera().await? {
                println!("Camera session started");
            } else {
                println!("Camera session already running");
            }
        }
        Commands::Stop => {
            if proxy.stop_camera().await? {
                println!("Camera session stopped");
            } else {
                println!("No camera session running");
            }
        }
        Commands::Mark => print_json(&proxy.capture_and_mark().await?)?,
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Recent => print_json(&proxy.recent_marks().await?)?,
        Commands::Enroll {
            student,
            name,
            index,
            image,
            image_url,
        } => {
            // The daemon resolves the path, so hand it an absolute one.
            let image = image
                .canonicalize()
                .with_context(|| format!("reading {}", image.display()))?;
            let id = proxy
                .enroll(
                    &student,
                    &name,
                    &index,
                    &image.to_string_lossy(),
                    &image_url,
                )
                .await?;
            println!("Enrolled {student} (embedding {id})");
        }
        Commands::Set {
            student,
            status,
            date,
            remarks,
        } => {
            proxy
                .set_attendance(&student, &date, &status, &remarks)
                .await?;
            println!("Attendance for {student} set to {status}");
        }
        Commands::Attendance { date } => print_json(&proxy.attendance(&date).await?)?,
        // Handled above without the daemon.
        Commands::Devices | Commands::Test { .. } => {}
    }

    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("decoding daemon reply")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
