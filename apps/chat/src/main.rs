use anyhow::{Context, Result};
use clap::Parser;
use client_core::{ChatSession, SendOutcome};
use shared::domain::Login;
use tokio::io::{stdin, AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:50051")]
    server_url: String,
    /// Prompted for when omitted.
    #[arg(long)]
    login: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Register `login` before chatting; needs `--password`.
    #[arg(long)]
    register: bool,
    #[arg(long)]
    full_name: Option<String>,
}

type Input = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .without_time()
        .init();
    let args = Args::parse();
    let mut input = BufReader::new(stdin()).lines();

    let login = match args.login.as_deref() {
        Some(raw) => Login::parse(raw)?,
        None => prompt_login(&mut input).await?,
    };
    let mut session = ChatSession::connect(&args.server_url, login)?;
    info!(login = %session.login(), server_url = %args.server_url, "chat client connected");

    if args.register {
        let password = args
            .password
            .as_deref()
            .context("--register needs --password")?;
        let full_name = args
            .full_name
            .clone()
            .unwrap_or_else(|| session.login().to_string());
        session.register(&full_name, password).await?;
    } else if let Some(password) = args.password.as_deref() {
        session.authenticate(password).await?;
    }

    session.open_receiver().await;
    let result = run_chat(&mut session, &mut input).await;
    session.close_receiver().await;
    info!("quitting chat app");
    result
}

async fn prompt_login(input: &mut Input) -> Result<Login> {
    loop {
        println!("login: ");
        let line = input.next_line().await?.context("stdin closed")?;
        match Login::parse(&line) {
            Ok(login) => return Ok(login),
            Err(err) => info!("{err}"),
        }
    }
}

async fn run_chat(session: &mut ChatSession, input: &mut Input) -> Result<()> {
    loop {
        println!("\nType user to start chat with or /q to quit:");
        let Some(line) = input.next_line().await? else {
            return Ok(());
        };
        let line = line.trim();
        if line == "/q" {
            return Ok(());
        }
        if !session.is_session_valid() {
            error!("user is not registered");
            return Ok(());
        }
        let peer = match Login::parse(line) {
            Ok(peer) => peer,
            Err(err) => {
                warn!("{err}");
                continue;
            }
        };
        if !chat_with(session, input, &peer).await? {
            return Ok(());
        }
        info!("disconnected from chatroom with user: {peer}");
    }
}

/// Returns `false` when the session can no longer be used.
async fn chat_with(session: &mut ChatSession, input: &mut Input, peer: &Login) -> Result<bool> {
    info!("if you want to leave the chatroom, type /q");
    while let Some(line) = input.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/q" {
            break;
        }
        match session.send_to(peer, text).await {
            Ok(SendOutcome::Sent) => {}
            Ok(SendOutcome::RecipientNotFound { .. }) => break,
            Ok(SendOutcome::SessionInvalid) => return Ok(false),
            Err(err) => error!(%err, "message not sent"),
        }
    }
    Ok(true)
}
