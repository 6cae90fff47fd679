use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use checklist_sync::{ChecklistSession, ChecklistStore, SessionView};
use chrono::Utc;
use clap::{Parser, Subcommand};
use core_model::{checklist_url, new_checklist_id};
use recent::{FileStorage, RecencyCache};
use store_sqlite::SqliteBackend;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;
mod ui;

use config::{Config, LogFormat};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);
const CHANGE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "checklist")]
#[command(about = "Shared checklists that stay in sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Database file; overrides `database_path` from the config file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Do not read or record recently visited checklists.
    #[arg(long, global = true, default_value_t = false)]
    no_recent: bool,
}

#[derive(Subcommand)]
enum Commands {
    Init,
    /// Create a checklist with a fresh id.
    New { title: Option<String> },
    Show { id: String },
    Title { id: String, title: String },
    Add {
        id: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    Done {
        id: String,
        item: String,
        #[arg(long, default_value_t = false)]
        undo: bool,
    },
    Edit {
        id: String,
        item: String,
        text: String,
    },
    Rm { id: String, item: String },
    ClearCompleted {
        id: String,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Print a portable JSON copy of the checklist.
    Export { id: String },
    /// Follow a checklist and print every change.
    Watch {
        id: String,
        #[arg(long = "for")]
        duration: Option<String>,
    },
    Recent {
        #[command(subcommand)]
        command: RecentCommand,
    },
    Doctor,
}

#[derive(Subcommand)]
enum RecentCommand {
    List,
    Remove {
        id: String,
    },
    Clear {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

struct App {
    backend: Arc<SqliteBackend>,
    store: ChecklistStore,
    recent: Arc<RecencyCache>,
    base_url: String,
}

impl App {
    fn open(&self, id: &str) -> ChecklistSession {
        ChecklistSession::open(
            self.store.clone(),
            self.recent.clone(),
            id,
            &checklist_url(&self.base_url, id),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    init_tracing(config.log_format);
    let t = Instant::now();

    let backend = match cli.db.as_ref().or(config.database_path.as_ref()) {
        Some(path) => SqliteBackend::open(path)?,
        None => SqliteBackend::open_default()?,
    };
    backend.init_schema()?;
    let backend = Arc::new(backend);
    // other `checklist` processes write to the same file
    let _change_watcher = backend.watch_external_changes(CHANGE_POLL_INTERVAL);
    let recent = if cli.no_recent || !config.recent_enabled {
        RecencyCache::disabled()
    } else {
        let dir = config
            .recent_dir
            .clone()
            .unwrap_or_else(FileStorage::default_dir);
        RecencyCache::new(Arc::new(FileStorage::new(dir)))
    };
    let app = App {
        store: ChecklistStore::new(backend.clone()),
        backend,
        recent: Arc::new(recent),
        base_url: config.base_url.clone(),
    };

    match cli.command {
        Commands::Init => {
            info!(elapsed = ?t.elapsed(), "initialized");
        }
        Commands::New { title } => {
            let id = new_checklist_id();
            app.store.create_checklist(&id, title.as_deref()).await?;
            let session = app.open(&id);
            let view = session.wait_until_loaded().await;
            info!(checklist_id = %id, elapsed = ?t.elapsed(), "checklist ready");
            ui::print_view(&view, session.url());
        }
        Commands::Show { id } => {
            let session = app.open(&id);
            let view = session.wait_until_loaded().await;
            ui::print_view(&view, session.url());
        }
        Commands::Title { id, title } => {
            let session = app.open(&id);
            session.wait_until_loaded().await;
            if !session.rename(&title).await? {
                println!("title unchanged");
            }
            print_latest(&app, &session).await?;
        }
        Commands::Add { id, text } => {
            let session = app.open(&id);
            session.wait_until_loaded().await;
            let text = text.join(" ");
            match session.add_item(&text).await? {
                Some(item_id) => info!(checklist_id = %id, item_id = %item_id, "item added"),
                None => println!("nothing to add"),
            }
            print_latest(&app, &session).await?;
        }
        Commands::Done { id, item, undo } => {
            let session = app.open(&id);
            let view = session.wait_until_loaded().await;
            let target = ui::resolve_item(&view, &item)?;
            if target.completed == !undo {
                println!("already {}", if undo { "open" } else { "done" });
            } else {
                session.toggle_item(&target.id).await?;
            }
            print_latest(&app, &session).await?;
        }
        Commands::Edit { id, item, text } => {
            let session = app.open(&id);
            let view = session.wait_until_loaded().await;
            let target = ui::resolve_item(&view, &item)?;
            if !session.edit_item_text(&target.id, &text).await? {
                println!("text unchanged");
            }
            print_latest(&app, &session).await?;
        }
        Commands::Rm { id, item } => {
            let session = app.open(&id);
            let view = session.wait_until_loaded().await;
            let target = ui::resolve_item(&view, &item)?;
            session.delete_item(&target.id).await?;
            print_latest(&app, &session).await?;
        }
        Commands::ClearCompleted { id, yes } => {
            let session = app.open(&id);
            let view = session.wait_until_loaded().await;
            let completed = view.stats().completed_count;
            if completed == 0 {
                println!("no completed items");
                return Ok(());
            }
            if !yes && !ui::confirm(&format!("delete {completed} completed item(s)?"))? {
                return Ok(());
            }
            let removed = session.clear_completed().await?;
            info!(checklist_id = %id, removed, elapsed = ?t.elapsed(), "cleared");
            print_latest(&app, &session).await?;
        }
        Commands::Export { id } => {
            let session = app.open(&id);
            let view = session.wait_until_loaded().await;
            let export = view.share_export(Utc::now());
            println!("{}", serde_json::to_string_pretty(&export)?);
        }
        Commands::Watch { id, duration } => {
            let limit = duration
                .as_deref()
                .map(ui::parse_watch_duration)
                .transpose()?;
            watch(&app, &id, limit).await?;
        }
        Commands::Recent { command } => match command {
            RecentCommand::List => {
                if !app.recent.is_enabled() {
                    println!("recent checklists are disabled");
                    return Ok(());
                }
                ui::print_recent(&app.recent.list(), Utc::now());
            }
            RecentCommand::Remove { id } => {
                app.recent.remove(&id);
                ui::print_recent(&app.recent.list(), Utc::now());
            }
            RecentCommand::Clear { yes } => {
                if yes || ui::confirm("forget all recent checklists?")? {
                    app.recent.clear();
                    info!("recent checklists cleared");
                }
            }
        },
        Commands::Doctor => {
            info!("running integrity check");
            let check = app.backend.integrity_check()?;
            let checklists = app.backend.checklist_count()?;
            info!(elapsed = ?t.elapsed(), "integrity check done");
            println!("integrity_check={check}");
            println!("checklists={checklists}");
            println!("recent_enabled={}", app.recent.is_enabled());
            println!("recent_entries={}", app.recent.list().len());
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Prints the stored state after a write once the session has caught up
/// with it, so the recency cache holds the final counts on exit.
async fn print_latest(app: &App, session: &ChecklistSession) -> anyhow::Result<()> {
    let checklist = app
        .store
        .get_checklist(session.id())
        .await
        .context("reading checklist")?;
    let items = app
        .store
        .list_items(session.id())
        .await
        .context("reading items")?;
    let mut rx = session.subscribe();
    let caught_up = tokio::time::timeout(
        SETTLE_TIMEOUT,
        rx.wait_for(|v| v.checklist == checklist && v.items == items),
    )
    .await
    .is_ok_and(|r| r.is_ok());
    if !caught_up {
        debug!(checklist_id = session.id(), "session did not catch up before exit");
    }
    let view = SessionView {
        checklist,
        items,
        loading: false,
    };
    ui::print_view(&view, session.url());
    Ok(())
}

async fn watch(app: &App, id: &str, limit: Option<Duration>) -> anyhow::Result<()> {
    let session = app.open(id);
    let mut view = session.subscribe();
    let mut connectivity = session.connectivity();
    let deadline = async {
        match limit {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    info!(checklist_id = id, "watching; ctrl-c to stop");
    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = view.borrow_and_update().clone();
                if !snapshot.loading {
                    ui::print_view(&snapshot, session.url());
                    println!();
                }
            }
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connectivity.borrow_and_update();
                ui::print_connectivity(state);
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    session.close();
    Ok(())
}
