use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use malleposte::auth::hash_password;
use malleposte::config::read_config;
use malleposte::server::Server;
use malleposte::storage::{Alias, Domain, Index, User};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(
        short,
        long,
        env = "MALLEPOSTE_CONFIG",
        default_value = "malleposte.toml"
    )]
    /// Path to the main configuration file
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SMTP+IMAP server daemon
    Daemon,

    /// Manage user accounts
    #[clap(subcommand)]
    Account(AccountCommand),

    /// Manage local domains
    #[clap(subcommand)]
    Domain(DomainCommand),

    /// Manage address aliases
    #[clap(subcommand)]
    Alias(AliasCommand),

    /// Hash a password for external provisioning
    PasswordHash {
        #[clap(env = "MALLEPOSTE_PASSWORD")]
        maybe_password: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum AccountCommand {
    /// Add an account
    Add {
        #[clap(short, long)]
        email: String,
        #[clap(long, env = "MALLEPOSTE_PASSWORD")]
        password: Option<String>,
        /// Quota in bytes, 0 for unlimited
        #[clap(long, default_value_t = 0)]
        quota: u64,
        #[clap(long)]
        admin: bool,
    },
    /// Delete an account
    Delete {
        #[clap(short, long)]
        email: String,
    },
    /// Change an account's password
    ChangePassword {
        #[clap(short, long)]
        email: String,
        #[clap(long, env = "MALLEPOSTE_NEW_PASSWORD")]
        new_password: Option<String>,
    },
    /// List accounts
    List,
}

#[derive(Subcommand, Debug)]
enum DomainCommand {
    Add {
        name: String,
    },
    Delete {
        name: String,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum AliasCommand {
    Add {
        source: String,
        target: String,
    },
    Delete {
        source: String,
    },
    /// List the aliases of a domain
    List {
        domain: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "malleposte=info");
    }
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Command::Daemon => {
            let config = read_config(args.config_file)?;
            let server = Server::from_config(config)?;
            server.run().await?;
        }
        Command::Account(cmd) => {
            let config = read_config(args.config_file)?;
            let index = Index::open(&config.storage.db_path)?;
            account_management(&index, cmd)?;
        }
        Command::Domain(cmd) => {
            let config = read_config(args.config_file)?;
            let index = Index::open(&config.storage.db_path)?;
            match cmd {
                DomainCommand::Add { name } => index.create_domain(&Domain {
                    name: name.to_ascii_lowercase(),
                    active: true,
                })?,
                DomainCommand::Delete { name } => index.delete_domain(&name)?,
                DomainCommand::List => {
                    for domain in index.list_domains()? {
                        println!("{}\t{}", domain.name, if domain.active { "active" } else { "disabled" });
                    }
                }
            }
        }
        Command::Alias(cmd) => {
            let config = read_config(args.config_file)?;
            let index = Index::open(&config.storage.db_path)?;
            match cmd {
                AliasCommand::Add { source, target } => {
                    let domain = source
                        .rsplit_once('@')
                        .map(|(_, d)| d.to_ascii_lowercase())
                        .context("alias source must be a full address")?;
                    index.create_alias(&Alias {
                        source,
                        target,
                        domain,
                    })?;
                }
                AliasCommand::Delete { source } => index.delete_alias(&source)?,
                AliasCommand::List { domain } => {
                    for alias in index.list_aliases(&domain)? {
                        println!("{}\t{}", alias.source, alias.target);
                    }
                }
            }
        }
        Command::PasswordHash { maybe_password } => {
            let password = match maybe_password {
                Some(pwd) => pwd,
                None => rpassword::prompt_password("Enter password: ")?,
            };
            println!("{}", hash_password(&password)?);
        }
    }

    Ok(())
}

fn account_management(index: &Index, cmd: AccountCommand) -> Result<()> {
    match cmd {
        AccountCommand::Add {
            email,
            password,
            quota,
            admin,
        } => {
            let password = match password {
                Some(pwd) => pwd,
                None => {
                    let password = rpassword::prompt_password("Enter password: ")?;
                    let confirm = rpassword::prompt_password("Confirm password: ")?;
                    if password != confirm {
                        bail!("Passwords don't match.");
                    }
                    password
                }
            };
            index.create_user(&User {
                id: 0,
                email: email.clone(),
                password_hash: hash_password(&password)?,
                totp_secret: None,
                quota_bytes: quota,
                active: true,
                admin,
                created_at: Utc::now(),
            })?;
            tracing::info!(user = %email, "account created");
        }
        AccountCommand::Delete { email } => {
            index.delete_user(&email)?;
            tracing::info!(user = %email, "account deleted");
        }
        AccountCommand::ChangePassword { email, new_password } => {
            let mut user = index.get_user(&email).context("user must exist first")?;
            let new_password = match new_password {
                Some(pwd) => pwd,
                None => {
                    let password = rpassword::prompt_password("Enter new password: ")?;
                    let confirm = rpassword::prompt_password("Confirm new password: ")?;
                    if password != confirm {
                        bail!("Passwords don't match.");
                    }
                    password
                }
            };
            user.password_hash = hash_password(&new_password)?;
            index.update_user(&user)?;
        }
        AccountCommand::List => {
            for user in index.list_users(u32::MAX, 0)? {
                println!(
                    "{}\t{}\t{}",
                    user.email,
                    if user.active { "active" } else { "disabled" },
                    if user.admin { "admin" } else { "user" }
                );
            }
        }
    }
    Ok(())
}
