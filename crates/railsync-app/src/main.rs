//! Headless railsync node: hosts a session as dispatcher or joins one as a
//! client, and runs the yard at a fixed tick rate until Ctrl-C.

mod dirs;
mod ticker;
mod world;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use railsync_config::{CliArgs, Config, ConfigError};
use railsync_multiplayer::messages::ControlLevel;
use railsync_multiplayer::sim::SimError;
use railsync_multiplayer::{
    CarCatalog, CatalogError, Driver, Roster, Session, SessionConfig, SessionError,
    SessionEvent,
};
use tokio::time::MissedTickBehavior;

use crate::dirs::{AppDirs, DirsError};
use crate::ticker::FixedStep;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Dirs(#[from] DirsError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("could not place the local train: {0}")]
    Placement(#[from] SimError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("could not host session: {0}")]
    Host(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "railsync stopped");
            eprintln!("railsync: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> Result<(), AppError> {
    let dirs = AppDirs::resolve(args.config.as_deref())?;
    dirs.create_all()?;

    let mut config = Config::load_or_create(&dirs.config_dir)?;
    config.apply_cli_overrides(&args);
    railsync_log::init_logging(Some(&dirs.log_dir), config.debug.log_to_file, Some(&config));

    let catalog = match &config.multiplayer.rolling_stock_dir {
        Some(dir) => CarCatalog::scan(dir)?,
        None => world::yard_catalog(),
    };
    let user = config.multiplayer.username.clone();
    let mut sim = world::build_yard();
    let local = world::place_local_train(&mut sim, &catalog, &user)?;

    let mut session = Session::new(
        SessionConfig::from_config(&config.multiplayer),
        user.as_str(),
        &config.multiplayer.route,
        sim,
        catalog,
    );
    session.set_local_train(local)?;
    let mut driver = Driver::new(session, &config.network, config.multiplayer.inbox_capacity);

    if args.dispatcher {
        let roster_path = dirs.roster_path();
        if roster_path.exists() {
            match Roster::load(&roster_path) {
                Ok(roster) => driver.session_mut().restore_roster(roster),
                Err(e) => tracing::warn!(error = %e, "saved roster ignored"),
            }
        }
        let addr = driver.host(config.network.server_port)?;
        tracing::info!(%addr, user = %user, "dispatching");
    } else if driver
        .connect(&config.network.server_address, config.network.server_port)
        .await
    {
        driver.join_game(&user, &config.multiplayer.route, &config.multiplayer.session_code)?;
    } else {
        tracing::warn!("continuing in single-player");
    }

    run_loop(&mut driver, config.multiplayer.tick_hz).await;

    if args.dispatcher {
        save_roster(&driver.session().roster(), &dirs);
    }
    driver.stop().await;
    tracing::info!("railsync shut down");
    Ok(())
}

async fn run_loop(driver: &mut Driver, tick_hz: u32) {
    let mut clock = FixedStep::new(tick_hz);
    let mut interval = tokio::time::interval(Duration::from_secs_f64(clock.step()));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let session = driver.session_mut();
                let local = session.local_train();
                clock.advance(|dt| {
                    if let Some(number) = local {
                        world::advance_train(session.sim_mut(), number, dt);
                    }
                });
                for event in driver.pump(clock.total()).await {
                    log_event(&event);
                }
            }
            _ = &mut shutdown => {
                tracing::info!("interrupt received, leaving session");
                break;
            }
        }
    }
}

fn save_roster(roster: &Roster, dirs: &AppDirs) {
    let path = dirs.roster_path();
    match roster.save(&path) {
        Ok(()) => tracing::info!(path = %path.display(), players = roster.records.len(), "roster saved"),
        Err(e) => tracing::warn!(error = %e, "could not save roster"),
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Notification { level, text } => match level {
            ControlLevel::Error => tracing::error!("{text}"),
            ControlLevel::Warning => tracing::warn!("{text}"),
            ControlLevel::Information => tracing::info!("{text}"),
        },
        SessionEvent::Chat { from, text } => tracing::info!(from = %from, "chat: {text}"),
        SessionEvent::PlayerJoined { user, train } => tracing::info!(user = %user, train, "player joined"),
        SessionEvent::PlayerLost { user } => tracing::info!(user = %user, "player lost"),
        SessionEvent::PlayerLeft { user } => tracing::info!(user = %user, "player left"),
        SessionEvent::AuthorityChanged { user, train } => {
            tracing::info!(user = %user, train, "train control changed")
        }
        SessionEvent::FellBackToSinglePlayer { reason } => {
            tracing::warn!(reason = %reason, "multiplayer ended, continuing in single-player")
        }
    }
}
