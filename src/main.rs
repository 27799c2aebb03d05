use clap::{Parser, Subcommand};
use snx_connect::VpnManager;
use snx_connect::session::ConnectError;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "snx-connect")]
#[command(about = "Session manager and split-route toolkit for the Checkpoint SNX VPN client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the VPN server
    Connect {
        /// VPN server; falls back to the saved one
        #[arg(short, long)]
        server: Option<String>,
        /// Username; falls back to the saved one
        #[arg(short, long)]
        user: Option<String>,
        /// Persist credentials across disconnects
        #[arg(short, long)]
        keep: bool,
    },
    /// Disconnect and clean up routes
    Disconnect,
    /// List saved routes
    Routes,
    /// Resolve a domain and route it through the VPN
    AddRoute { domain: String },
    /// Remove one saved route
    RemoveRoute { domain: String, address: String },
    /// Control whether saved routes survive a disconnect
    KeepRoutes { enabled: bool },
    /// Report whether the SNX client and elevation helper are installed
    Check,
    /// Install the SNX client via the bundled script
    Install,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut manager = VpnManager::new()?;

    match cli.command {
        Commands::Connect { server, user, keep } => {
            let saved = manager.saved_state()?;
            let server = server
                .or(saved.server)
                .ok_or(ConnectError::MissingCredentials)?;
            let username = user
                .or(saved.username)
                .ok_or(ConnectError::MissingCredentials)?;
            let password = match saved.password {
                Some(password) => password,
                None => rpassword::prompt_password(format!("Password for {username}: "))?,
            };
            let keep_credentials = keep || saved.keep_credentials;

            info!("Connecting to {} as {}", server, username);
            let office_ip = manager
                .connect(&server, &username, &password, keep_credentials)
                .await?;
            println!("Connected. Office-mode IP: {office_ip}");
        }
        Commands::Disconnect => {
            let message = manager.disconnect().await?;
            println!("{message}");
        }
        Commands::Routes => {
            let entries = manager.saved_routes()?;
            if entries.is_empty() {
                println!("No saved routes.");
            } else {
                for entry in entries {
                    println!("{} -> {}", entry.domain, entry.address);
                }
            }
        }
        Commands::AddRoute { domain } => {
            let addresses = manager.add_route(&domain).await?;
            println!("Routed {} address(es) for {}:", addresses.len(), domain);
            for address in addresses {
                println!("  {address}");
            }
        }
        Commands::RemoveRoute { domain, address } => {
            manager.remove_route(&domain, &address).await?;
            println!("Removed route {address} ({domain})");
        }
        Commands::KeepRoutes { enabled } => {
            manager.set_keep_routes(enabled)?;
            println!("Keep routes: {enabled}");
        }
        Commands::Check => {
            let deps = manager.check_dependencies();
            println!(
                "SNX client: {}",
                if deps.client_installed {
                    "installed"
                } else {
                    "missing"
                }
            );
            println!(
                "Elevation helper: {}",
                if deps.elevation_helper_installed {
                    "installed"
                } else {
                    "missing"
                }
            );
        }
        Commands::Install => {
            let message = manager.install_client().await?;
            println!("{message}");
        }
    }

    Ok(())
}
