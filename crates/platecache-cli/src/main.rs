//! platecache - command line access to the offline restaurant directory.
//!
//! Reads are served from the local store when possible; mutations are
//! applied locally, queued and delivered as soon as the API is reachable.

use std::io;

use anyhow::{anyhow, bail, Context as _, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use platecache_core::models::{NewReview, Restaurant, RestaurantFilter};
use platecache_core::sync::DrainOutcome;
use platecache_core::{Config, Context, Directory};

/// Set to a directory to also write logs to a daily rolling file there.
const LOG_DIR_ENV: &str = "PLATECACHE_LOG_DIR";

const USAGE: &str = "\
Usage: platecache [--offline] <command> [args]

Commands:
  list [--cuisine C] [--neighborhood N] [--refresh]   List restaurants
  show <id>                                           Show one restaurant
  reviews <id> [--refresh]                            List reviews for a restaurant
  review <id> <name> <rating> [comments...]           Submit a review
  favorite <id> <true|false>                          Set the favorite flag
  neighborhoods                                       List neighborhoods
  cuisines                                            List cuisines
  prefetch                                            Cache everything for offline use
  pending                                             Show queued writes
  sync                                                Deliver queued writes now
";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "platecache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let offline = take_flag(&mut args, "--offline");
    if args.is_empty() || args[0] == "help" || args[0] == "--help" || args[0] == "-h" {
        print!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load().context("Failed to load configuration")?;
    if offline {
        config.offline_mode = true;
    }
    let ctx = Context::from_config(config).context("Failed to open local store")?;
    let directory = Directory::new(&ctx);
    info!(command = %args[0], "platecache starting");

    let command = args.remove(0);
    let result = run(&directory, &command, args).await;
    directory.shutdown().await;
    result
}

async fn run(directory: &Directory, command: &str, mut args: Vec<String>) -> Result<()> {
    match command {
        "list" => {
            let refresh = take_flag(&mut args, "--refresh");
            let cuisine = take_option(&mut args, "--cuisine")?.unwrap_or_else(|| "all".into());
            let neighborhood =
                take_option(&mut args, "--neighborhood")?.unwrap_or_else(|| "all".into());
            if refresh {
                directory.refresh_restaurants().await?;
            }
            let filter = RestaurantFilter::from_selection(&cuisine, &neighborhood);
            for restaurant in directory.restaurants_matching(&filter).await? {
                print_summary(&restaurant);
            }
        }
        "show" => {
            let id = parse_id(args.first())?;
            let restaurant = directory.restaurant(id).await?;
            print_summary(&restaurant);
            if let Some(ref address) = restaurant.address {
                println!("    {}", address);
            }
            for (day, hours) in &restaurant.operating_hours {
                println!("    {:<10} {}", day, hours);
            }
            println!("    image: {}", restaurant.image_url());
            println!("    page:  {}", restaurant.page_url());
        }
        "reviews" => {
            let refresh = take_flag(&mut args, "--refresh");
            let id = parse_id(args.first())?;
            let reviews = if refresh {
                directory.refresh_reviews(id).await?
            } else {
                directory.reviews(id).await?
            };
            for review in reviews {
                println!("{} ({}/5)", review.name, review.rating);
                if !review.comments.is_empty() {
                    println!("    {}", review.comments);
                }
            }
        }
        "review" => {
            if args.len() < 3 {
                bail!("Usage: platecache review <id> <name> <rating> [comments...]");
            }
            let restaurant_id = parse_id(args.first())?;
            let rating: i64 = args[2]
                .parse()
                .with_context(|| format!("Invalid rating: {}", args[2]))?;
            let review = directory
                .submit_review(NewReview {
                    restaurant_id,
                    name: args[1].clone(),
                    rating,
                    comments: args[3..].join(" "),
                })
                .await?;
            println!("Saved review by {} for restaurant {}", review.name, review.restaurant_id);
            print_pending(directory).await?;
        }
        "favorite" => {
            let id = parse_id(args.first())?;
            let value: bool = args
                .get(1)
                .ok_or_else(|| anyhow!("Usage: platecache favorite <id> <true|false>"))?
                .parse()
                .context("Expected true or false")?;
            let update = directory.toggle_favorite(id, value).await?;
            println!(
                "Restaurant {} favorite = {}{}",
                update.restaurant_id,
                update.is_favorite,
                if update.cached { "" } else { " (not cached locally)" }
            );
            print_pending(directory).await?;
        }
        "neighborhoods" => {
            for name in directory.neighborhoods().await? {
                println!("{}", name);
            }
        }
        "cuisines" => {
            for name in directory.cuisines().await? {
                println!("{}", name);
            }
        }
        "prefetch" => {
            let report = directory.prefetch().await?;
            println!(
                "Cached {} restaurants and {} reviews",
                report.restaurants, report.reviews
            );
            if !report.failed.is_empty() {
                println!("Could not cache: {:?}", report.failed);
            }
        }
        "pending" => {
            let ops = directory.queue().list().await?;
            if ops.is_empty() {
                println!("No pending writes");
            }
            for op in ops {
                let method = op.method.map_or("?", |m| m.as_str());
                let when = op
                    .enqueued_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("#{:<6} {:<6} {:<40} {}", op.id.0, method, op.url, when);
            }
        }
        "sync" => {
            let report = directory.sync().await?;
            println!(
                "Delivered {}, purged {}",
                report.delivered.len(),
                report.purged.len()
            );
            match report.outcome {
                DrainOutcome::Empty => println!("Queue is empty"),
                DrainOutcome::Blocked { id, reason, .. } => {
                    println!("Stopped at #{}: {}", id, reason);
                    print_pending(directory).await?;
                }
                DrainOutcome::Deferred { retry_after } => {
                    println!("Deferred until {}", retry_after);
                }
            }
        }
        other => {
            eprint!("{}", USAGE);
            bail!("Unknown command: {}", other);
        }
    }
    Ok(())
}

fn print_summary(restaurant: &Restaurant) {
    println!(
        "{:>4}  {}{}  [{} / {}]",
        restaurant.id,
        restaurant.name,
        if restaurant.is_favorite { " *" } else { "" },
        restaurant.cuisine_type.as_deref().unwrap_or("-"),
        restaurant.neighborhood.as_deref().unwrap_or("-"),
    );
}

async fn print_pending(directory: &Directory) -> Result<()> {
    let pending = directory.queue().len().await?;
    if pending > 0 {
        println!("{} write(s) waiting for the network", pending);
    }
    Ok(())
}

fn parse_id(arg: Option<&String>) -> Result<i64> {
    let arg = arg.ok_or_else(|| anyhow!("Missing restaurant id"))?;
    arg.parse()
        .with_context(|| format!("Invalid restaurant id: {}", arg))
}

/// Remove `flag` from `args`, returning whether it was present.
fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

/// Remove `name value` from `args`, returning the value.
fn take_option(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == name) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{} needs a value", name);
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}
