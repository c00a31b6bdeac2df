use anyhow::Context;
use clap::{Parser, Subcommand};
use homeaffairs::render::{TerminalRenderer, transcript_html};
use homeaffairs::{
    AppConfig, ChatError, CredentialStore, FileStore, HubClient, MemoryStore, RelayConfig, Role,
    StreamingChatSession,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "homeaffairs", version, about = "Hong Kong Home Affairs AI assistant")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask a single question and stream the answer
    Ask {
        question: Vec<String>,
        /// Also write the conversation as an HTML page
        #[arg(long)]
        html: Option<PathBuf>,
    },
    /// Interactive chat, one line per turn
    Chat {
        /// Continue the conversation saved by a previous run
        #[arg(long)]
        resume: bool,
        /// Keep nothing on disk; credentials live only for this process
        #[arg(long)]
        ephemeral: bool,
    },
    /// Exchange HA_API_EMAIL / HA_API_PASSWORD for a cached token
    Login,
    /// Forget the cached token, conversation and transcript
    Logout,
    /// Run the same-origin relay in front of the hub
    Relay,
}

fn load_dotenv() {
    if let Err(err) = dotenvy::dotenv()
        && !err.not_found()
    {
        eprintln!("ignoring unreadable .env: {err}");
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,homeaffairs=info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Blocks on a configuration problem before any request is made.
fn load_config() -> anyhow::Result<AppConfig> {
    match AppConfig::from_env() {
        Ok(config) => Ok(config),
        Err(ChatError::Config(reason)) => {
            eprintln!("Setup required\n==============\n{reason}\n");
            eprintln!("Add the values to .env or the environment, for example:");
            eprintln!("  HA_API_KEY=dak-...            (developer API key)");
            eprintln!("  HA_API_EMAIL / HA_API_PASSWORD (account login)");
            anyhow::bail!("configuration incomplete")
        }
        Err(err) => Err(err.into()),
    }
}

fn open_session(config: &AppConfig, store: Arc<dyn CredentialStore>) -> StreamingChatSession {
    let client = HubClient::new(config.clone(), store.clone());
    StreamingChatSession::new(config, Box::new(client), store)
}

async fn run_turn(
    session: &mut StreamingChatSession,
    renderer: &mut TerminalRenderer<std::io::Stdout>,
    text: &str,
) -> anyhow::Result<()> {
    let mut render_error = None;
    let result = session
        .send(text, |event| {
            if let Err(err) = renderer.render(event) {
                render_error.get_or_insert(err);
            }
        })
        .await;
    renderer.finish_turn()?;
    if let Some(err) = render_error {
        return Err(err.into());
    }
    match result {
        Ok(()) => Ok(()),
        Err(ChatError::Input(reason)) => {
            eprintln!("{reason}");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn ask(question: Vec<String>, html: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config()?;
    let question = question.join(" ");
    if question.trim().is_empty() {
        anyhow::bail!("nothing to ask");
    }

    let store: Arc<dyn CredentialStore> = Arc::new(FileStore::default_location());
    let mut session = open_session(&config, store);
    let mut renderer = TerminalRenderer::new(std::io::stdout());
    run_turn(&mut session, &mut renderer, &question).await?;

    if let Some(path) = html {
        let page = transcript_html(session.transcript(), session.citations());
        std::fs::write(&path, page)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote transcript");
    }
    Ok(())
}

async fn chat(resume: bool, ephemeral: bool) -> anyhow::Result<()> {
    let config = load_config()?;
    let store: Arc<dyn CredentialStore> = if ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(FileStore::default_location())
    };

    let mut session = open_session(&config, store);
    if resume {
        session = session.with_persisted_transcript();
    }
    for message in session.transcript() {
        let speaker = match message.role {
            Role::User => "You",
            Role::Assistant => "Assistant",
        };
        println!("{speaker}: {}", message.content);
    }
    let mut renderer = TerminalRenderer::new(std::io::stdout());

    println!("Ask about Home Affairs services. /quit to leave.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            text => run_turn(&mut session, &mut renderer, text).await?,
        }
    }
    Ok(())
}

async fn login() -> anyhow::Result<()> {
    let config = load_config()?;
    let store = Arc::new(FileStore::default_location());
    let client = HubClient::new(config, store.clone());
    client.login().await?;
    println!("Logged in. Token cached in {}", store.dir().display());
    Ok(())
}

fn logout() -> anyhow::Result<()> {
    let store = FileStore::default_location();
    store.clear()?;
    println!("Cleared saved credentials and conversation.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Ask { question, html } => ask(question, html).await,
        Command::Chat { resume, ephemeral } => chat(resume, ephemeral).await,
        Command::Login => login().await,
        Command::Logout => logout(),
        Command::Relay => {
            let config = RelayConfig::from_env()?;
            homeaffairs::relay::serve(config).await?;
            Ok(())
        }
    }
}
