use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use fieldx::fxstruct;
use spot_sync::prelude::*;
use spot_sync::HttpApi;
use spot_sync::HttpConfig;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Sort {
    Recent,
    MostLiked,
}

impl From<Sort> for SortOrder {
    fn from(sort: Sort) -> Self {
        match sort {
            Sort::Recent => SortOrder::Recent,
            Sort::MostLiked => SortOrder::MostLiked,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// List food spots.
    Spots,
    /// List reviews of a food spot.
    Reviews {
        spot: i64,
        #[clap(long, value_enum, default_value_t = Sort::Recent)]
        sort: Sort,
    },
    /// Toggle the like of a review.
    Like { spot: i64, review: i64 },
    /// Add a food spot to the favourites.
    Favourite { spot: i64 },
    /// Remove a food spot from the favourites.
    Unfavourite { spot: i64 },
}

#[derive(Debug, Clone, Parser)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, name = "spot-sync")]
struct Cli {
    /// API root URL.
    #[fieldx(get(clone))]
    #[clap(long, env = "SPOTSYNC_BASE_URL")]
    base_url: String,

    /// Bearer token.
    #[fieldx(get(clone))]
    #[clap(long, env = "SPOTSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Id of the signed-in user; needed to see your own reviews.
    #[clap(long, env = "SPOTSYNC_USER")]
    user: Option<i64>,

    /// Request timeout in milliseconds.
    #[clap(long, env = "SPOTSYNC_TIMEOUT_MS", default_value_t = 15_000)]
    timeout_ms: u64,

    /// Maximum age of a cached entry in seconds.
    #[clap(long, env = "SPOTSYNC_MAX_AGE_SECS", default_value_t = 60)]
    max_age_secs: u64,

    #[fieldx(get(clone))]
    #[clap(subcommand)]
    command: Command,
}

fn setup_tracing() -> Result<(), SyncError> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::from_default_env();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| SyncError::Config(format!("cannot initialize tracing: {err}")))?;

    info!("Tracing initialized");
    Ok(())
}

fn api_failure(err: Arc<ApiError>) -> SyncError {
    SyncError::Api((*err).clone())
}

fn print_spots(spots: &[FoodSpot]) {
    for spot in spots {
        let rating = spot.average_rating.map_or("-".to_string(), |r| format!("{r:.1}"));
        let favourite = if spot.is_favourite { "*" } else { " " };
        println!("{favourite} {:>6}  {:<32} {rating:>4}  ({} reviews)", spot.id, spot.name, spot.reviews_count);
    }
}

fn print_reviews(reviews: &[Review]) {
    for review in reviews {
        let liked = if review.liked_by_me { "♥" } else { " " };
        println!(
            "{liked} {:>6}  {}/5  {:>4} likes  {}: {}",
            review.id,
            review.rating,
            review.likes_count,
            review.author_name.as_deref().unwrap_or("anonymous"),
            review.comment.as_deref().unwrap_or("")
        );
    }
}

fn report(outcome: &MutationOutcome) {
    match outcome {
        MutationOutcome::Committed { kind, .. } => println!("{kind:?}: done"),
        MutationOutcome::RolledBack { kind, error } => {
            eprintln!("{kind:?} failed ({}): {}", error.class(), error.user_message())
        }
        MutationOutcome::GuardRejected => eprintln!("already in progress"),
    }
}

async fn run(cli: &Cli) -> Result<(), SyncError> {
    let config = HttpConfig::builder()
        .base_url(cli.base_url())
        .token(cli.token())
        .timeout(Duration::from_millis(cli.timeout_ms()))
        .build()
        .map_err(SyncError::builder("HTTP configuration"))?;

    let sync = SpotSync::builder()
        .api(HttpApi::new(&config)?)
        .max_age(Duration::from_secs(cli.max_age_secs()))
        .build()
        .map_err(SyncError::builder("engine"))?;

    if let Some(user) = cli.user() {
        sync.login(UserId(user));
    }

    match cli.command() {
        Command::Spots => {
            let spots = sync.fetch(CacheKey::FoodSpots).await.map_err(api_failure)?;
            print_spots(spots.as_spots().unwrap_or_default());
        }
        Command::Reviews { spot, sort } => {
            let key = CacheKey::Reviews(SpotId(spot), sort.into());
            let reviews = sync.fetch(key).await.map_err(api_failure)?;
            print_reviews(reviews.as_reviews().unwrap_or_default());
        }
        Command::Like { spot, review } => {
            // The toggle resolves to like or unlike from the cached state.
            let key = CacheKey::Reviews(SpotId(spot), SortOrder::Recent);
            sync.fetch(key).await.map_err(api_failure)?;
            let outcome = sync.toggle_like(SpotId(spot), ReviewId(review)).await?;
            report(&outcome);
            let current = sync
                .peek(&key)
                .and_then(|entry| entry.value().and_then(|v| v.find_review(ReviewId(review)).cloned()));
            if let Some(current) = current {
                print_reviews(&[current]);
            }
        }
        Command::Favourite { spot } => report(&sync.favourite(SpotId(spot)).await?),
        Command::Unfavourite { spot } => report(&sync.unfavourite(SpotId(spot)).await?),
    }

    sync.close();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = setup_tracing() {
        eprintln!("{err}");
    }

    if let Err(err) = run(&cli).await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
