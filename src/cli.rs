//! CLI interface for voicedesk

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::audit::AuditLog;
use crate::calendar::HttpCalendar;
use crate::config::Config;
use crate::events::EventBus;
use crate::filler::FillerLibrary;
use crate::llm::LlmClient;
use crate::orchestrator::AppContext;
use crate::outbound::OutboundDispatcher;
use crate::phonebook::Phonebook;
use crate::session::SessionStore;
use crate::sms::ProviderSms;
use crate::speech::stt::StreamingStt;
use crate::speech::tts::StreamingTts;
use crate::telephony::TelephonyClient;

#[derive(Parser)]
#[command(name = "voicedesk")]
#[command(about = "Real-time telephony voice agent for appointment scheduling", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook + media server
    Serve,
    /// Validate the phonebook file and print a summary
    Phonebook {
        /// Path to the phonebook JSON (defaults to PHONEBOOK_PATH)
        #[arg(short, long)]
        path: Option<String>,
    },
    /// Print the effective configuration (secrets redacted)
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => serve().await,
        Commands::Phonebook { path } => {
            let path = match path {
                Some(path) => path,
                None => std::env::var("PHONEBOOK_PATH").unwrap_or_else(|_| "phonebook.json".into()),
            };
            let book = Phonebook::load(&path)?;
            println!("{}: {} entries, all E.164-valid", path, book.len());
            Ok(())
        }
        Commands::Config => {
            let config = Config::from_env()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Wire the process: load config, build collaborators, serve.
async fn serve() -> Result<()> {
    let config = Arc::new(Config::from_env().context("configuration invalid")?);
    let http = reqwest::Client::new();

    let phonebook = Arc::new(Phonebook::load(&config.call.phonebook_path)?);
    #[cfg(unix)]
    Phonebook::watch_sighup(&phonebook);

    let fillers = Arc::new(FillerLibrary::load(&config.call.filler_dir)?);
    let store = SessionStore::new();
    let audit = AuditLog::start(config.audit.db_uri.clone(), http.clone());
    let events = EventBus::default();

    let sms = Arc::new(ProviderSms::new(&config.telephony, http.clone()));
    let outbound = OutboundDispatcher::new(
        Arc::clone(&store),
        Arc::new(TelephonyClient::new(&config.telephony, http.clone())),
        sms.clone(),
        audit.clone(),
        config.server.base_url.clone(),
    );

    let app = AppContext {
        config: Arc::clone(&config),
        store,
        phonebook,
        fillers,
        llm: Arc::new(LlmClient::new(&config.llm, http.clone())),
        calendar: Arc::new(HttpCalendar::new(config.audit.calendar_uri.clone(), http.clone())),
        stt: Arc::new(StreamingStt::new(&config.speech)),
        tts: Arc::new(StreamingTts::new(&config.speech, http)),
        sms,
        outbound,
        audit,
        events,
    };

    crate::server::serve(app).await
}
