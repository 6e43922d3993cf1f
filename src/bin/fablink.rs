use clap::{Parser, Subcommand};
use fablink_orders::cli::{self as prog_cli, Command};
use fablink_orders::config::StoreConfig;
use fablink_orders::{Store, logger};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fablink", version, about = "FabLink order store CLI", long_about = None)]
struct Cli {
    /// Path to a config file (TOML)
    #[arg(long, help = "Path to a config file (TOML). Defaults to $FABLINK_CONFIG, then ./fablink.toml.")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Register an order from the step template (idempotent)")]
    Seed {
        order_id: String,
        #[arg(long)]
        designer: Option<String>,
        #[arg(long)]
        product: Option<String>,
        #[arg(long, help = "Extra order fields as a JSON object")]
        fields: Option<String>,
    },
    #[command(about = "Print an order, repairing it first")]
    Show { order_id: String },
    #[command(about = "Complete the current step, or a stage of it")]
    Complete {
        order_id: String,
        step: i32,
        #[arg(long)]
        stage: Option<i32>,
    },
    #[command(about = "Restore missing steps and stages on an order")]
    Repair { order_id: String },
    #[command(about = "Add or replace a factory bid on step 1")]
    Bid {
        order_id: String,
        factory_id: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        contact: String,
        #[arg(long, default_value_t = 0)]
        price: i64,
        #[arg(long, default_value = "")]
        expect_work_day: String,
    },
    #[command(about = "Accept a factory bid")]
    Accept { order_id: String, factory_id: String },
    #[command(about = "Find documents; prints NDJSON")]
    Find {
        collection: String,
        #[arg(default_value = "{}")]
        filter: String,
        #[arg(long, help = "Comma-separated top-level fields to keep")]
        project: Option<String>,
        #[arg(long, help = "Comma-separated fields, prefix '-' for descending")]
        sort: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        skip: Option<usize>,
    },
    #[command(about = "Count matching documents")]
    Count {
        collection: String,
        #[arg(default_value = "{}")]
        filter: String,
    },
    #[command(about = "Update one document")]
    Update {
        collection: String,
        filter: String,
        update: String,
        #[arg(long)]
        upsert: bool,
        /// JSON array of array filters for `$[name]` placeholders
        #[arg(long)]
        array_filters: Option<String>,
    },
    #[command(about = "Create the order indexes")]
    Indexes,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = logger::init() {
        eprintln!("warning: logging not initialised: {e}");
    }
    let cfg = match StoreConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };
    let store = match Store::open(&cfg) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    let cmd = match cli.command {
        Commands::Seed { order_id, designer, product, fields } => {
            Command::Seed { order_id, designer_id: designer, product_id: product, fields_json: fields }
        }
        Commands::Show { order_id } => Command::Show { order_id },
        Commands::Complete { order_id, step, stage } => Command::Complete { order_id, step, stage },
        Commands::Repair { order_id } => Command::Repair { order_id },
        Commands::Bid { order_id, factory_id, name, contact, price, expect_work_day } => {
            Command::Bid { order_id, factory_id, name, contact, price, expect_work_day }
        }
        Commands::Accept { order_id, factory_id } => Command::Accept { order_id, factory_id },
        Commands::Find { collection, filter, project, sort, limit, skip } => {
            Command::Find { collection, filter_json: filter, project, sort, limit, skip }
        }
        Commands::Count { collection, filter } => Command::Count { collection, filter_json: filter },
        Commands::Update { collection, filter, update, upsert, array_filters } => Command::Update {
            collection,
            filter_json: filter,
            update_json: update,
            upsert,
            array_filters_json: array_filters,
        },
        Commands::Indexes => Command::Indexes,
    };
    if let Err(e) = prog_cli::run(&store, cmd) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
