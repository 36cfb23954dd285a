//! `lbs` — CLI companion for the LibreSeed seeder daemon. Talks to the
//! control plane over HTTP; every command maps to one or two requests.

use base64::Engine as _;
use clap::{Parser, Subcommand};
use libreseed::keystore::KeyStore;
use libreseed::signing::{canonicalize_manifest, sha256_hex, Manifest, ManifestFiles};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "lbs", about = "LibreSeed seeder CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Start,
    Stop,
    Status,
    Restart,
    Stats,
    Add {
        file: PathBuf,
        name: String,
        version: String,
        description: Option<String>,
    },
    List,
    Remove {
        package_id: String,
    },
    Apikey {
        #[command(subcommand)]
        action: ApikeyAction,
    },
    Version,
}

#[derive(Subcommand)]
enum ApikeyAction {
    Generate { name: String, level: String },
    List,
    Revoke { id: String },
    Delete { id: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(command))
}

async fn dispatch(command: Command) -> anyhow::Result<()> {
    let addr = resolve_control_plane_addr();
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    match command {
        Command::Start => {
            println!("lbs does not supervise the daemon process; run `lbsd` directly or via your service manager.");
        }
        Command::Stop => {
            let resp = client.post(format!("{base}/shutdown")).send().await?;
            print_status(resp).await?;
        }
        Command::Status => {
            if let Some((pid, host_port)) = read_pid_file() {
                println!("lbsd running: pid={pid} addr={host_port}");
            } else {
                println!("lbsd not running");
            }
        }
        Command::Restart => {
            let _ = client.post(format!("{base}/shutdown")).send().await;
            println!("sent shutdown; start lbsd again to resume");
        }
        Command::Stats => {
            let resp = client.get(format!("{base}/stats")).send().await?;
            print_status(resp).await?;
        }
        Command::List => {
            let resp = client.get(format!("{base}/packages/list")).send().await?;
            print_status(resp).await?;
        }
        Command::Remove { package_id } => {
            let resp = client
                .delete(format!("{base}/packages/{package_id}"))
                .send()
                .await?;
            print_status(resp).await?;
        }
        Command::Add {
            file,
            name,
            version,
            description,
        } => add_package(&client, &base, file, name, version, description).await?,
        Command::Apikey { action } => apikey(&client, &base, action).await?,
        Command::Version => println!("lbs {}", env!("CARGO_PKG_VERSION")),
    }

    Ok(())
}

async fn add_package(
    client: &reqwest::Client,
    base: &str,
    file: PathBuf,
    name: String,
    version: String,
    description: Option<String>,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(&file)?;
    let package_id = sha256_hex(&bytes);
    let file_basename = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("package.tgz")
        .to_string();

    let key_dir = default_keys_dir();
    let keystore = KeyStore::ensure_keys(&key_dir)?;
    let pubkey_field = format!(
        "ed25519:{}",
        base64::engine::general_purpose::STANDARD.encode(keystore.public_key().to_bytes())
    );

    let mut files = ManifestFiles::new();
    files.insert(file_basename, format!("sha256:{package_id}"));

    let manifest = Manifest {
        name: name.clone(),
        version: version.clone(),
        description: description.clone().unwrap_or_default(),
        files,
        content_hash: format!("sha256:{package_id}"),
        pubkey: pubkey_field.clone(),
    };

    let canonical = canonicalize_manifest(&manifest);
    let signature = keystore.sign(&canonical);
    let sig_field = format!(
        "ed25519:{}",
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    );

    let descriptor_sig = keystore.sign(format!("sha256:{package_id}").as_bytes());
    let descriptor_sig_field = format!(
        "ed25519:{}",
        base64::engine::general_purpose::STANDARD.encode(descriptor_sig.to_bytes())
    );

    let form = reqwest::multipart::Form::new()
        .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file.to_string_lossy().into_owned()))
        .text("name", name)
        .text("version", version)
        .text("description", description.unwrap_or_default())
        .text("manifest", serde_json::to_string(&manifest)?)
        .text("creator_pubkey", pubkey_field.clone())
        .text("creator_signature", sig_field.clone())
        .text("maintainer_pubkey", pubkey_field.clone())
        .text("maintainer_signature", sig_field)
        .text("descriptor_pubkey", pubkey_field)
        .text("descriptor_signature", descriptor_sig_field);

    let resp = client.post(format!("{base}/packages/add")).multipart(form).send().await?;
    print_status(resp).await
}

async fn apikey(client: &reqwest::Client, base: &str, action: ApikeyAction) -> anyhow::Result<()> {
    let admin_key = std::env::var("LIBRESEED_ADMIN_KEY").unwrap_or_default();
    let url_keys = format!("{base}/api/v1/admin/keys");

    match action {
        ApikeyAction::Generate { name, level } => {
            let resp = client
                .post(&url_keys)
                .bearer_auth(&admin_key)
                .json(&serde_json::json!({ "name": name, "level": level }))
                .send()
                .await?;
            print_status(resp).await?;
        }
        ApikeyAction::List => {
            let resp = client.get(&url_keys).bearer_auth(&admin_key).send().await?;
            print_status(resp).await?;
        }
        ApikeyAction::Revoke { id } => {
            let resp = client
                .post(format!("{url_keys}/{id}/revoke"))
                .bearer_auth(&admin_key)
                .send()
                .await?;
            print_status(resp).await?;
        }
        ApikeyAction::Delete { id } => {
            let resp = client
                .delete(format!("{url_keys}/{id}"))
                .bearer_auth(&admin_key)
                .send()
                .await?;
            print_status(resp).await?;
        }
    }
    Ok(())
}

async fn print_status(resp: reqwest::Response) -> anyhow::Result<()> {
    let status = resp.status();
    let body = resp.text().await?;
    if status.is_success() {
        println!("{body}");
        Ok(())
    } else {
        anyhow::bail!("{} {}", status.as_u16(), body)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("libreseed")
}

fn default_keys_dir() -> PathBuf {
    default_data_dir().join("keys")
}

fn default_pid_path() -> PathBuf {
    default_data_dir().join("lbsd.pid")
}

/// Discovery order: PID file, then `LIBRESEED_LISTEN_ADDR`, then the
/// built-in default. A stale PID file (process not alive) is ignored.
fn resolve_control_plane_addr() -> String {
    if let Some((_, addr)) = read_pid_file() {
        return addr;
    }
    if let Ok(addr) = std::env::var("LIBRESEED_LISTEN_ADDR") {
        return addr;
    }
    "127.0.0.1:9091".to_string()
}

fn read_pid_file() -> Option<(u32, String)> {
    let contents = std::fs::read_to_string(default_pid_path()).ok()?;
    let (pid_str, addr) = contents.trim().split_once(':')?;
    let pid: u32 = pid_str.parse().ok()?;
    if !process_is_alive(pid) {
        return None;
    }
    Some((pid, addr.to_string()))
}

/// A PID file is only trusted when the process is alive *and* its executable
/// is actually `lbsd` — a reused PID from an unrelated process must not be
/// mistaken for a running daemon.
#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|comm| comm.trim() == "lbsd")
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    true
}
