use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use workshop_core::{
    clock::SystemClock,
    config::{self, AppConfig},
    db::{self, DbPool},
    entities::{order_history, part},
    services::{factory::ServiceContainer, orders::OrderDetails},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Migrate => handle_migrate(&context).await?,
        Commands::Slots(args) => handle_slots(&context, args, cli.json).await?,
        Commands::LowStock => handle_low_stock(&context, cli.json).await?,
        Commands::History(args) => handle_history(&context, args, cli.json).await?,
        Commands::Order(args) => handle_order(&context, args, cli.json).await?,
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "workshop-cli", about = "Workshop order and calendar tools", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Free appointment slots of a day
    Slots(SlotsArgs),
    /// Parts at or below their reorder threshold
    LowStock,
    /// Audit trail of an order, most recent first
    History(OrderArgs),
    /// An order with its items, appointment and history
    Order(OrderArgs),
}

#[derive(Args)]
struct SlotsArgs {
    #[arg(help = "Day as YYYY-MM-DD")]
    date: String,
}

#[derive(Args)]
struct OrderArgs {
    #[arg(help = "Order identifier")]
    order_id: i32,
}

struct CliContext {
    config: AppConfig,
    db: Arc<DbPool>,
    services: ServiceContainer,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        let db = Arc::new(db_pool);
        let services = ServiceContainer::start(db.clone(), &config, Arc::new(SystemClock));

        Ok(Self {
            config,
            db,
            services,
        })
    }
}

async fn handle_migrate(context: &CliContext) -> Result<()> {
    db::run_migrations(&context.db)
        .await
        .context("failed to run migrations")?;
    println!(
        "Migrations applied ({} environment)",
        context.config.environment
    );
    Ok(())
}

async fn handle_slots(context: &CliContext, args: SlotsArgs, json: bool) -> Result<()> {
    let slots = context
        .services
        .appointments
        .get_available_slots(&args.date)
        .await
        .context("failed to compute available slots")?;

    if json {
        print_json(&slots)?;
    } else if slots.is_empty() {
        println!("No free slots on {}", args.date);
    } else {
        println!("Free slots on {}: {}", args.date, slots.join(", "));
    }
    Ok(())
}

async fn handle_low_stock(context: &CliContext, json: bool) -> Result<()> {
    let parts = context
        .services
        .inventory
        .low_stock_parts()
        .await
        .context("failed to load low-stock parts")?;

    if json {
        print_json(&parts)?;
    } else if parts.is_empty() {
        println!("All parts are above their reorder threshold");
    } else {
        println!("{} part(s) low on stock:", parts.len());
        for part in &parts {
            render_part(part);
        }
    }
    Ok(())
}

async fn handle_history(context: &CliContext, args: OrderArgs, json: bool) -> Result<()> {
    let details = context
        .services
        .orders
        .get_order(args.order_id)
        .await
        .with_context(|| format!("failed to load order {}", args.order_id))?;

    if json {
        print_json(&details.history)?;
    } else {
        for entry in &details.history {
            render_history(entry);
        }
    }
    Ok(())
}

async fn handle_order(context: &CliContext, args: OrderArgs, json: bool) -> Result<()> {
    let details = context
        .services
        .orders
        .get_order(args.order_id)
        .await
        .with_context(|| format!("failed to load order {}", args.order_id))?;

    if json {
        print_json(&details)?;
    } else {
        render_order(&details);
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_part(part: &part::Model) {
    println!(
        "- {} {} • on hand {} • threshold {}",
        part.sku, part.name, part.stock_quantity, part.min_stock_level
    );
}

fn render_history(entry: &order_history::Model) {
    println!(
        "- {} • user {} • {} • {}",
        entry.created_at.format("%Y-%m-%d %H:%M"),
        entry.user_id,
        entry.action,
        entry.comment.as_deref().unwrap_or("")
    );
}

fn render_order(details: &OrderDetails) {
    let order = &details.order;
    println!(
        "Order {} • {} • {} • total {}",
        order.id,
        details.vehicle.display_name(),
        order.status.label(),
        order.total_amount
    );
    if let Some(appointment) = &details.appointment {
        println!(
            "Visit: {} ({} min, {})",
            appointment.scheduled_at.format("%Y-%m-%d %H:%M"),
            appointment.estimated_min,
            appointment.status
        );
    }
    if details.items.is_empty() {
        println!("No items");
    } else {
        println!("Items ({}):", details.items.len());
        for item in &details.items {
            println!("- [{}] {}", item.item_type, item.summary());
        }
    }
    println!("History entries: {}", details.history.len());
}
