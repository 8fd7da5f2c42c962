use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::domain::{Login, QueueName, UserInfo};
use storage::{open_store, DrainMode, QueueStore, UserDirectory};

#[derive(Parser, Debug)]
struct Cli {
    /// `memory:` or a sqlite URL; must match the server's store.
    #[arg(long, default_value = "sqlite://./data/chat.db")]
    store_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    RegisterUser {
        login: String,
        full_name: String,
        #[arg(long)]
        password: String,
    },
    ListUsers,
    /// Pending count plus the most recent history entries for one user.
    QueueStatus {
        login: String,
        #[arg(long, default_value_t = 10)]
        history: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = open_store(&cli.store_url).await?;

    match cli.command {
        Command::RegisterUser {
            login,
            full_name,
            password,
        } => {
            let login = Login::parse(login)?;
            UserDirectory::new(store)
                .register(
                    UserInfo {
                        login: login.clone(),
                        full_name,
                    },
                    &password,
                )
                .await?;
            println!("registered user {login}");
        }
        Command::ListUsers => {
            for user in UserDirectory::new(store).list().await? {
                println!("{} - {}", user.login, user.full_name);
            }
        }
        Command::QueueStatus { login, history } => {
            let login = Login::parse(login)?;
            let queues = QueueStore::new(store);
            queues.ensure_user_queues(&login).await?;
            let pending = queues
                .drain(&login, QueueName::ToSend, DrainMode::PeekAll)
                .await;
            println!("{login}: {} pending", pending.len());
            for entry in queues.history(&login, history).await {
                match entry.decode() {
                    Ok(message) => println!(
                        "  {} [{}] {} -> {}: {}",
                        entry.key,
                        message.timestamp.format("%Y-%m-%d %H:%M"),
                        message.from_user,
                        message.to_user,
                        message.body
                    ),
                    Err(err) => println!("  {} <undecodable: {err}>", entry.key),
                }
            }
        }
    }

    Ok(())
}
