//! hnc-controller: hierarchical namespace controller
//!
//! Loads a forest manifest into an in-memory store, applies one hierarchy
//! command, runs the controller until the forest converges and prints the
//! requested view. The converged forest is written back to the manifest
//! whenever it differs from what was loaded.
//!
//! Exit codes: 0 success, 1 validation failure, 2 not found, 3 store failure.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hnc_controller::{Config, Manifest};
use hnc_core::{views, Controller, HierarchyCommands, HncError, MemoryStore, ObjectStore};

const DEFAULT_FILTER: &str = "hnc_core=info,hnc_controller=info";

#[derive(Parser)]
#[command(name = "hnc-controller")]
#[command(about = "Hierarchical namespace controller")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "hnc-controller.toml")]
    config: PathBuf,

    /// Forest manifest (YAML)
    #[arg(short, long, env = "HNC_MANIFEST", default_value = "forest.yaml")]
    manifest: PathBuf,

    /// Number of reconcile workers (overrides config file)
    #[arg(long, env = "HNC_WORKERS")]
    workers: Option<usize>,

    /// Log as JSON lines
    #[arg(long, env = "HNC_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile the forest and print every tree
    Run {
        /// Keep watching for changes until interrupted
        #[arg(long)]
        watch: bool,
    },

    /// Render the tree rooted at a namespace
    Tree { namespace: String },

    /// Describe a namespace
    Describe { namespace: String },

    /// Print the status document of a namespace
    Status { namespace: String },

    /// Create a full namespace
    CreateNamespace { namespace: String },

    /// Delete a namespace
    DeleteNamespace { namespace: String },

    /// Make a namespace a root, creating it if needed
    DeclareRoot { namespace: String },

    /// Set the parent of a namespace
    SetParent { namespace: String, parent: String },

    /// Remove the parent of a namespace
    UnsetParent { namespace: String },

    /// Allow or forbid cascading deletion of anchored subnamespaces
    SetCascadingDelete {
        namespace: String,
        #[arg(action = clap::ArgAction::Set)]
        allow: bool,
    },

    /// Create a subnamespace through an anchor in its parent
    CreateSubnamespace { parent: String, name: String },

    /// Delete the anchor of a subnamespace
    DeleteSubnamespace { parent: String, name: String },

    /// Mark a namespace as a subnamespace of a parent
    AnnotateSubnamespace { namespace: String, parent: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    init_tracing(&config, cli.log_json)?;

    if let Some(workers) = cli.workers {
        config.controller.workers = workers;
    }
    config.controller.validate()?;

    let manifest = Manifest::load(&cli.manifest)?;
    let store = Arc::new(MemoryStore::new());
    manifest.apply(&store).await?;
    info!(
        manifest = %cli.manifest.display(),
        namespaces = manifest.namespaces.len(),
        "Forest loaded"
    );

    let shared: Arc<dyn ObjectStore> = store.clone();
    let controller = Controller::new(Arc::clone(&shared), config.controller.clone());
    let commands = HierarchyCommands::new(Arc::clone(&shared));
    controller.run_until_idle().await?;

    let result = match cli.command {
        Command::Run { watch } => {
            if watch {
                let handle = controller.start().await?;
                info!("Watching for changes, press Ctrl-C to stop");
                tokio::signal::ctrl_c().await?;
                handle.shutdown().await;
            }
            print_forest(shared.as_ref()).await
        }
        Command::Tree { namespace } => views::tree(shared.as_ref(), &namespace).await.map(print),
        Command::Describe { namespace } => {
            views::describe(shared.as_ref(), &namespace).await.map(print)
        }
        Command::Status { namespace } => match shared.get_hierarchy(&namespace).await {
            Ok(record) => views::status_yaml(&record).map(print),
            Err(e) => Err(HncError::from(e)),
        },
        Command::CreateNamespace { namespace } => commands.create_namespace(&namespace).await,
        Command::DeleteNamespace { namespace } => commands.delete_namespace(&namespace).await,
        Command::DeclareRoot { namespace } => commands.declare_root(&namespace).await,
        Command::SetParent { namespace, parent } => commands.set_parent(&namespace, &parent).await,
        Command::UnsetParent { namespace } => commands.unset_parent(&namespace).await,
        Command::SetCascadingDelete { namespace, allow } => {
            commands.set_cascading_delete(&namespace, allow).await
        }
        Command::CreateSubnamespace { parent, name } => {
            commands.create_anchored_subnamespace(&parent, &name).await
        }
        Command::DeleteSubnamespace { parent, name } => {
            commands.delete_anchored_subnamespace(&parent, &name).await
        }
        Command::AnnotateSubnamespace { namespace, parent } => {
            commands.annotate_as_subnamespace_of(&namespace, &parent).await
        }
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }

    // Converge after the command and persist the result
    controller.run_until_idle().await?;
    let converged = Manifest::capture(&store, manifest.denied_privileges.clone()).await?;
    if converged != manifest {
        converged.save(&cli.manifest)?;
        info!(manifest = %cli.manifest.display(), "Manifest updated");
    }

    Ok(())
}

fn init_tracing(config: &Config, log_json: bool) -> anyhow::Result<()> {
    let default = config.logging.filter.as_deref().unwrap_or(DEFAULT_FILTER);
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if log_json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn print(output: String) {
    print!("{output}");
}

async fn print_forest(store: &dyn ObjectStore) -> hnc_core::Result<()> {
    let forest = hnc_core::HierarchyStore::load(store).await?;
    for root in forest.roots() {
        if let Some(tree) = views::render_tree(&forest, &root) {
            println!("{tree}");
        }
    }
    Ok(())
}
