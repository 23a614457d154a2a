use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn enroll(&self, name: &str, photo_path: &str) -> zbus::Result<String>;
    async fn remove(&self, name: &str) -> zbus::Result<bool>;
    async fn take_attendance(&self, photo_path: &str) -> zbus::Result<String>;
    async fn save_attendance(&self, statuses_json: &str) -> zbus::Result<String>;
    async fn list_students(&self) -> zbus::Result<String>;
    async fn summary(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Photo-based classroom attendance")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from a portrait photo (.jpg, .jpeg or .png)
    Enroll {
        /// Student name (stored lowercase)
        #[arg(short, long)]
        name: String,
        photo: PathBuf,
    },
    /// Remove an enrolled student
    Remove { name: String },
    /// Take attendance from a group photo and notify guardians of absentees
    Take { photo: PathBuf },
    /// Save today's attendance; students not listed are Absent
    Save {
        /// Statuses as NAME=STATUS (e.g., ann=Present)
        #[arg(value_parser = parse_status_pair)]
        statuses: Vec<(String, String)>,
    },
    /// List enrolled students
    List,
    /// Show today's attendance summary
    Summary,
    /// Show daemon status
    Status,
}

fn parse_status_pair(s: &str) -> Result<(String, String), String> {
    let (name, status) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=STATUS, got {s:?}"))?;
    Ok((name.trim().to_string(), status.trim().to_string()))
}

/// The daemon resolves paths itself, so send it absolute ones.
fn absolute(path: &Path) -> Result<String> {
    let path = std::fs::canonicalize(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Enroll { name, photo } => {
            let identity = proxy.enroll(&name, &absolute(&photo)?).await?;
            println!("Enrolled {identity}");
        }
        Commands::Remove { name } => {
            if proxy.remove(&name).await? {
                println!("Removed {name}");
            } else {
                println!("{name} was not enrolled");
            }
        }
        Commands::Take { photo } => {
            print_json(&proxy.take_attendance(&absolute(&photo)?).await?)?;
        }
        Commands::Save { statuses } => {
            let body: serde_json::Map<String, serde_json::Value> = statuses
                .into_iter()
                .map(|(name, status)| (name, serde_json::Value::String(status)))
                .collect();
            let path = proxy
                .save_attendance(&serde_json::Value::Object(body).to_string())
                .await?;
            println!("Attendance saved to {path}");
        }
        Commands::List => print_json(&proxy.list_students().await?)?,
        Commands::Summary => print_json(&proxy.summary().await?)?,
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}
