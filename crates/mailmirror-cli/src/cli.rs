use clap::{Args, Parser, Subcommand};
use mailmirror_core::{BadgeFilter, GroupMode, MessageQuery, SearchField};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mailmirror", version, about = "Local mailbox index and threading engine")]
pub(crate) struct Cli {
    /// Keep config.toml and the index under this directory instead of the
    /// platform defaults.
    #[arg(long = "config-dir", global = true)]
    pub(crate) config_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create the config file and the index, then print where they live.
    Init,
    Accounts(AccountsCmd),
    Folders(FoldersCmd),
    /// List or search messages.
    List(QueryArgs),
    /// List or search threads.
    Threads(QueryArgs),
    /// Group counts for a listing without fetching messages.
    Groups(QueryArgs),
    /// Every message of the given threads, oldest first.
    Thread(ThreadArgs),
    /// Show one message with its attachments.
    Show { id: String },
    /// Recipient suggestions from recent outgoing headers.
    Suggest(SuggestArgs),
    /// Write a JSON batch of messages into the index.
    Ingest(IngestArgs),
    Flags(FlagsArgs),
    Move(MoveArgs),
    Delete(DeleteArgs),
    #[command(name = "rename-prefix")]
    RenamePrefix(RenamePrefixArgs),
    #[command(name = "sync-state")]
    SyncState(SyncStateCmd),
}

#[derive(Args, Debug)]
pub(crate) struct AccountsCmd {
    #[command(subcommand)]
    pub(crate) command: AccountsCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum AccountsCommand {
    List,
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        name: Option<String>,
    },
    Delete {
        id: String,
    },
}

#[derive(Args, Debug)]
pub(crate) struct FoldersCmd {
    #[command(subcommand)]
    pub(crate) command: FoldersCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum FoldersCommand {
    List {
        #[arg(long)]
        account: String,
    },
    /// Replace the folder list of an account from a JSON array.
    Set {
        #[arg(long)]
        account: String,
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
pub(crate) struct QueryArgs {
    #[arg(long)]
    pub(crate) account: String,
    #[arg(long)]
    pub(crate) folder: Option<String>,
    #[arg(long, short = 'q', default_value = "")]
    pub(crate) query: String,
    #[arg(long = "field")]
    pub(crate) fields: Vec<SearchField>,
    #[arg(long = "badge")]
    pub(crate) badges: Vec<BadgeFilter>,
    #[arg(long = "attachments-only")]
    pub(crate) attachments_only: bool,
    #[arg(long, default_value_t = 1)]
    pub(crate) page: u32,
    #[arg(long = "page-size")]
    pub(crate) page_size: Option<u32>,
    #[arg(long = "group", default_value = "date")]
    pub(crate) group_by: GroupMode,
}

impl QueryArgs {
    pub(crate) fn to_query(&self, default_page_size: u32) -> MessageQuery {
        let mut query = MessageQuery::new(self.account.as_str())
            .with_text(self.query.as_str())
            .with_page(self.page, self.page_size.unwrap_or(default_page_size))
            .grouped_by(self.group_by);
        if let Some(folder) = &self.folder {
            query = query.in_folder(folder.as_str());
        }
        query.fields = self.fields.clone();
        query.badges = self.badges.clone();
        query.attachments_only = self.attachments_only;
        query
    }
}

#[derive(Args, Debug)]
pub(crate) struct ThreadArgs {
    #[arg(long)]
    pub(crate) account: String,
    #[arg(long = "thread-id")]
    pub(crate) thread_ids: Vec<String>,
    #[arg(long = "message-id")]
    pub(crate) message_ids: Vec<String>,
}

#[derive(Args, Debug)]
pub(crate) struct SuggestArgs {
    #[arg(long)]
    pub(crate) account: String,
    #[arg(long, short = 'q', default_value = "")]
    pub(crate) query: String,
    #[arg(long)]
    pub(crate) limit: Option<u32>,
}

#[derive(Args, Debug)]
pub(crate) struct IngestArgs {
    /// JSON file holding one batch.
    pub(crate) file: PathBuf,
    /// Treat the batch as a full fetch of its scope.
    #[arg(long)]
    pub(crate) replace: bool,
}

#[derive(Args, Debug)]
pub(crate) struct FlagsArgs {
    #[arg(long)]
    pub(crate) account: String,
    #[arg(long)]
    pub(crate) seen: Option<bool>,
    #[arg(long)]
    pub(crate) answered: Option<bool>,
    #[arg(long)]
    pub(crate) flagged: Option<bool>,
    #[arg(long)]
    pub(crate) deleted: Option<bool>,
    #[arg(long)]
    pub(crate) draft: Option<bool>,
    #[arg(required = true)]
    pub(crate) ids: Vec<String>,
}

#[derive(Args, Debug)]
pub(crate) struct MoveArgs {
    #[arg(long)]
    pub(crate) account: String,
    /// Destination mailbox path.
    #[arg(long)]
    pub(crate) to: String,
    #[arg(required = true)]
    pub(crate) ids: Vec<String>,
}

#[derive(Args, Debug)]
pub(crate) struct DeleteArgs {
    #[arg(long)]
    pub(crate) account: String,
    #[arg(required = true)]
    pub(crate) ids: Vec<String>,
}

#[derive(Args, Debug)]
pub(crate) struct RenamePrefixArgs {
    #[arg(long)]
    pub(crate) account: String,
    #[arg(long)]
    pub(crate) from: String,
    #[arg(long)]
    pub(crate) to: String,
}

#[derive(Args, Debug)]
pub(crate) struct SyncStateCmd {
    #[command(subcommand)]
    pub(crate) command: SyncStateCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum SyncStateCommand {
    List {
        #[arg(long)]
        account: String,
    },
    Get {
        #[arg(long)]
        account: String,
        #[arg(long)]
        mailbox: String,
    },
    Set {
        #[arg(long)]
        account: String,
        #[arg(long)]
        mailbox: String,
        #[arg(long = "uid-validity")]
        uid_validity: Option<u32>,
        #[arg(long = "highest-uid")]
        highest_uid: Option<u32>,
        #[arg(long = "highest-modseq")]
        highest_modseq: Option<u64>,
        #[arg(long)]
        incremental: bool,
    },
    Delete {
        #[arg(long)]
        account: String,
        #[arg(long)]
        mailbox: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_flags_map_onto_a_message_query() {
        let cli = Cli::try_parse_from([
            "mailmirror",
            "list",
            "--account",
            "acct",
            "--folder",
            "acct:INBOX",
            "-q",
            "from:alice@example.com report",
            "--field",
            "subject",
            "--badge",
            "unread",
            "--group",
            "domain",
            "--page",
            "2",
        ])
        .expect("parses");

        let Command::List(args) = cli.command else {
            panic!("expected list");
        };
        let query = args.to_query(200);
        assert_eq!(query.account_id, "acct");
        assert_eq!(query.folder_id.as_deref(), Some("acct:INBOX"));
        assert_eq!(query.fields, vec![SearchField::Subject]);
        assert_eq!(query.badges, vec![BadgeFilter::Unread]);
        assert_eq!(query.group_by, GroupMode::Domain);
        assert_eq!((query.page, query.page_size), (2, 200));
    }

    #[test]
    fn unknown_group_modes_are_rejected() {
        assert!(Cli::try_parse_from(["mailmirror", "groups", "--account", "a", "--group", "month"]).is_err());
    }

    #[test]
    fn config_dir_is_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from(["mailmirror", "init", "--config-dir", "/tmp/mm"]).expect("parses");
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/mm")));
    }
}
