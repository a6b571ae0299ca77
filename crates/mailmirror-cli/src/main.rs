mod cli;
mod state;

use anyhow::Context;
use clap::Parser;
use cli::{
    AccountsCommand, Cli, Command, FlagsArgs, FoldersCommand, IngestArgs, QueryArgs,
    SyncStateCommand,
};
use mailmirror_core::{
    folder_id_for, Account, AccountSettings, FlagChange, IngestBatch, IngestMode, MailFolder,
    MailboxState,
};
use mailmirror_storage::schema::SCHEMA_VERSION;
use serde::Serialize;
use state::{open_config, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(configured: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = open_config(cli.config_dir.as_deref())?;
    let config = config_manager.load().context("load app config")?;
    init_tracing(&config.logging.filter);
    tracing::debug!(path = %config_manager.config_path().display(), "loaded configuration");

    let state = AppState::initialize(config_manager, config).await?;
    let outcome = run(&state, cli.command).await;
    if let Err(err) = &outcome {
        tracing::error!(error = %err, "command failed");
    }
    state.shutdown().await;
    outcome
}

async fn run(state: &AppState, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Init => print_json(&serde_json::json!({
            "config": state.config_manager.config_path(),
            "database": state.config_manager.database_path(&state.config),
            "schema_version": SCHEMA_VERSION,
        })),
        Command::Accounts(cmd) => match cmd.command {
            AccountsCommand::List => print_json(&state.storage.list_accounts().await?),
            AccountsCommand::Add { id, address, name } => {
                let account = Account {
                    display_name: name.unwrap_or_else(|| address.clone()),
                    id,
                    address,
                    avatar_url: None,
                    settings: AccountSettings::default(),
                };
                state
                    .storage
                    .upsert_account(&account)
                    .await
                    .context("save account")?;
                print_json(&account)
            }
            AccountsCommand::Delete { id } => {
                state
                    .storage
                    .delete_account(&id)
                    .await
                    .with_context(|| format!("delete account {id}"))?;
                print_json(&serde_json::json!({ "deleted": id }))
            }
        },
        Command::Folders(cmd) => match cmd.command {
            FoldersCommand::List { account } => print_json(&state.storage.list_folders(&account).await?),
            FoldersCommand::Set { account, file } => {
                let folders: Vec<MailFolder> = read_json(&file)?;
                state
                    .storage
                    .replace_folders(&account, &folders)
                    .await
                    .context("replace folders")?;
                print_json(&state.storage.list_folders(&account).await?)
            }
        },
        Command::List(args) => {
            let query = to_query(state, &args);
            print_json(&state.query.list_messages(&query).await?)
        }
        Command::Threads(args) => {
            let query = to_query(state, &args);
            print_json(&state.query.list_threads(&query).await?)
        }
        Command::Groups(args) => {
            let query = to_query(state, &args);
            print_json(&state.query.group_counts(&query).await?)
        }
        Command::Thread(args) => print_json(
            &state
                .query
                .thread_messages(&args.account, &args.thread_ids, &args.message_ids)
                .await?,
        ),
        Command::Show { id } => match state.storage.get_message(&id).await? {
            Some(message) => print_json(&message),
            None => anyhow::bail!("message {id} not found"),
        },
        Command::Suggest(args) => print_json(
            &state
                .query
                .recipient_suggestions(&args.account, &args.query, args.limit)
                .await?,
        ),
        Command::Ingest(args) => ingest(state, args).await,
        Command::Flags(args) => set_flags(state, args).await,
        Command::Move(args) => {
            let moved = state
                .storage
                .move_messages(&args.account, &args.ids, &args.to)
                .await
                .context("move messages")?;
            print_json(&serde_json::json!({ "moved": moved }))
        }
        Command::Delete(args) => {
            let deleted = state
                .storage
                .delete_messages(&args.account, &args.ids)
                .await
                .context("delete messages")?;
            print_json(&serde_json::json!({ "deleted": deleted }))
        }
        Command::RenamePrefix(args) => {
            let renamed = state
                .storage
                .rename_folder_prefix(&args.account, &args.from, &args.to)
                .await
                .context("rename folder prefix")?;
            print_json(&renamed)
        }
        Command::SyncState(cmd) => sync_state(state, cmd.command).await,
    }
}

fn to_query(state: &AppState, args: &QueryArgs) -> mailmirror_core::MessageQuery {
    args.to_query(state.config.query.default_page_size)
}

async fn ingest(state: &AppState, args: IngestArgs) -> anyhow::Result<()> {
    let mut batch: IngestBatch = read_json(&args.file)?;
    if args.replace {
        batch.mode = IngestMode::Replace;
    }
    let report = state
        .ingest
        .ingest(&batch)
        .await
        .with_context(|| format!("ingest {}", args.file.display()))?;
    print_json(&report)
}

async fn set_flags(state: &AppState, args: FlagsArgs) -> anyhow::Result<()> {
    let change = FlagChange {
        seen: args.seen,
        answered: args.answered,
        flagged: args.flagged,
        deleted: args.deleted,
        draft: args.draft,
    };
    if change.is_empty() {
        anyhow::bail!("no flag changes given");
    }
    let updated = state
        .storage
        .update_flags(&args.account, &args.ids, change)
        .await
        .context("update flags")?;
    print_json(&serde_json::json!({ "updated": updated }))
}

async fn sync_state(state: &AppState, command: SyncStateCommand) -> anyhow::Result<()> {
    match command {
        SyncStateCommand::List { account } => print_json(&state.sync_state.list(&account).await?),
        SyncStateCommand::Get { account, mailbox } => {
            let folder_id = folder_id_for(&account, &mailbox);
            print_json(&state.sync_state.get(&account, &folder_id).await?)
        }
        SyncStateCommand::Set {
            account,
            mailbox,
            uid_validity,
            highest_uid,
            highest_modseq,
            incremental,
        } => {
            let mut next = MailboxState::new(&account, &mailbox);
            next.uid_validity = uid_validity;
            next.highest_uid = highest_uid;
            next.highest_modseq = highest_modseq;
            next.supports_incremental = incremental;
            print_json(&state.sync_state.save(&next).await?)
        }
        SyncStateCommand::Delete { account, mailbox } => {
            let folder_id = folder_id_for(&account, &mailbox);
            let removed = state.sync_state.delete(&account, &folder_id).await?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
    }
}
