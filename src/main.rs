#[macro_use]
extern crate log;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::{process, thread};

use job_scheduler_ng::{Job, JobScheduler};

use keygate::{db::Repositories, users::InMemoryUserStore, util::get_env_str_value, Config, Services};

fn main() {
    parse_args();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e.message());
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("Error initializing logging: {e:?}");
        process::exit(1);
    }

    launch_info(&config);

    let repos = Repositories::in_memory();
    let users = Arc::new(InMemoryUserStore::new());
    seed_users(&config, &users);

    schedule_jobs(repos.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Error creating tokio runtime");

    runtime.block_on(async move {
        let services = match Services::bootstrap(config, repos, users).await {
            Ok(services) => services,
            Err(e) => {
                error!("Failed to initialize services: {}", e.message());
                process::exit(1);
            }
        };

        if let Err(e) = keygate::rocket(services).launch().await {
            error!("Failed to launch the server: {e}");
            process::exit(1);
        }
    });
}

const HELP: &str = "\
An OpenID Connect / OAuth 2.0 identity provider.

USAGE:
    keygate

FLAGS:
    -h, --help       Prints help information
    -v, --version    Prints the app version

Configuration is read from the environment (or an .env file): OIDC_ISSUER,
OIDC_DEFAULT_AUDIENCE, PORT, NODE_ENV, SESSION_SECRET, LOG_LEVEL, LOG_FILE,
token TTL overrides, and the {GOOGLE,MICROSOFT,FACEBOOK,X}_CLIENT_ID/_SECRET
pairs plus MICROSOFT_TENANT for federated login.
";

pub fn parse_args() {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        println!("keygate {}", env!("CARGO_PKG_VERSION"));
        print!("{HELP}");
        process::exit(0);
    } else if pargs.contains(["-v", "--version"]) {
        println!("keygate {}", env!("CARGO_PKG_VERSION"));
        process::exit(0);
    }
}

fn launch_info(config: &Config) {
    println!("/--------------------------------------------------------------------\\");
    println!("|                          Starting Keygate                          |");
    println!("|{:^68}|", format!("Version {}", env!("CARGO_PKG_VERSION")));
    println!("\\--------------------------------------------------------------------/");
    println!();

    info!("Issuer: {}", config.issuer());
    info!("Listening on port {}", config.port());
    if config.production() {
        info!("Production mode: plaintext non-localhost requests will be refused");
    } else {
        warn!("Running in development mode");
    }
}

fn init_logging(config: &Config) -> Result<(), fern::InitError> {
    let level = log::LevelFilter::from_str(config.log_level()).unwrap_or(log::LevelFilter::Info);

    let mut logger = fern::Dispatch::new()
        .level(level)
        // Hide failed to close stream messages and other noise
        .level_for("hyper::proto", log::LevelFilter::Off)
        .level_for("hyper::client", log::LevelFilter::Off)
        .level_for("rustls", log::LevelFilter::Warn)
        .level_for("reqwest::connect", log::LevelFilter::Warn)
        .level_for("rocket::server", log::LevelFilter::Warn)
        .level_for("_", log::LevelFilter::Warn)
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(std::io::stdout());

    if let Some(log_file) = config.log_file() {
        logger = logger.chain(fern::log_file(log_file)?);
    }

    logger.apply()?;
    Ok(())
}

/// `SEED_USERS=email:password[,email:password...]` provisions password
/// accounts in the in-memory user store, for development setups that do not
/// run the external user service.
fn seed_users(config: &Config, users: &InMemoryUserStore) {
    let Some(raw) = get_env_str_value("SEED_USERS") else {
        return;
    };
    if config.production() {
        warn!("Ignoring SEED_USERS in production mode");
        return;
    }

    for entry in raw.split(',') {
        match entry.split_once(':') {
            Some((email, password)) if !email.is_empty() && !password.is_empty() => {
                let sub = users.seed_account(email.trim(), password, email.trim());
                info!("Seeded account {email} ({sub})");
            }
            _ => warn!("Ignoring malformed SEED_USERS entry"),
        }
    }
}

fn schedule_jobs(repos: Repositories) {
    let runtime = tokio::runtime::Runtime::new().expect("Error creating purge runtime");

    thread::Builder::new()
        .name("job-scheduler".to_string())
        .spawn(move || {
            let mut sched = JobScheduler::new();

            // Expired single-use rows are unreadable either way; purging keeps
            // the store from accumulating them.
            sched.add(Job::new("0 * * * * *".parse().expect("Valid cron expression"), || {
                runtime.spawn(purge_expired(repos.clone()));
            }));

            loop {
                sched.tick();
                thread::sleep(Duration::from_secs(30));
            }
        })
        .expect("Error spawning job scheduler thread");
}

async fn purge_expired(repos: Repositories) {
    let purges = [
        ("authorization_codes", repos.auth_codes.purge_expired().await),
        ("oauth_state", repos.oauth_state.purge_expired().await),
        ("refresh_tokens", repos.refresh_tokens.purge_expired().await),
    ];

    for (table, result) in purges {
        match result {
            Ok(0) => {}
            Ok(purged) => debug!("Purged {purged} expired {table} rows"),
            Err(e) => error!("Failed to purge expired {table}: {}", e.message()),
        }
    }
}
