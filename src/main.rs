use std::{process, sync::Arc};

use clap::Parser;
use tagport::{
    application::{error::AppError, repos::ModuleRepository, tokens::TokenCodec},
    cache::{CachedRepository, CleanupHandle, TtlCache, spawn_cleanup},
    config::{self, CliArgs, Command, TokenCommand},
    domain::credentials::BearerToken,
    infra::{
        archive_store::DirectoryArchiveStore,
        error::InfraError,
        github::GithubRepository,
        http::{self, HttpState},
        telemetry,
    },
};
use tokio::{signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let cli_args = CliArgs::parse();
    let settings = config::load(&cli_args)
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        Command::Serve(_) => run_serve(settings).await,
        Command::Token(args) => run_token(&settings, args.command),
    }
}

fn token_codec(settings: &config::Settings) -> Result<TokenCodec, AppError> {
    Ok(TokenCodec::from_secret(
        settings.proxy.secret.as_bytes(),
        settings.proxy.token_expiration,
    )?)
}

fn run_token(settings: &config::Settings, command: TokenCommand) -> Result<(), AppError> {
    let codec = token_codec(settings)?;
    match command {
        TokenCommand::Encode { credential } => {
            let credential = BearerToken::new(credential)
                .ok_or_else(|| AppError::validation("credential must not be blank"))?;
            println!("{}", codec.encode(&credential)?);
        }
        TokenCommand::Decode { token } => {
            println!("{}", codec.decode(token.trim())?.expose());
        }
    }
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let github = GithubRepository::new(&settings.github)?;
    let (repository, sweeper) = build_repository(&settings, github)?;

    let state = HttpState {
        repository,
        tokens: token_codec(&settings)?,
    };

    let result = serve_http(&settings, state).await;

    if let Some(sweeper) = sweeper {
        sweeper.stop().await;
    }

    result
}

fn build_repository(
    settings: &config::Settings,
    github: GithubRepository,
) -> Result<(Arc<dyn ModuleRepository>, Option<CleanupHandle>), AppError> {
    if !settings.cache.enabled {
        info!(
            target = "tagport::serve",
            "cache disabled; every request goes to GitHub"
        );
        return Ok((Arc::new(github), None));
    }

    let versions = Arc::new(TtlCache::<String, Vec<String>>::new(
        settings.cache.expiration,
    ));
    let archives = DirectoryArchiveStore::new(settings.cache.path.clone())
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let sweeper = spawn_cleanup(Arc::clone(&versions), settings.cache.cleanup_interval);

    info!(
        target = "tagport::serve",
        path = %settings.cache.path.display(),
        expiration = ?settings.cache.expiration,
        "cache enabled"
    );

    let cached = CachedRepository::new(github, versions, Arc::new(archives))
        .with_allow_list(settings.github.allow_list.clone());
    Ok((Arc::new(cached), Some(sweeper)))
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "tagport::serve",
        addr = %settings.server.addr,
        "listening"
    );

    let shutdown = CancellationToken::new();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let mut server: JoinHandle<std::io::Result<()>> = tokio::spawn(async move { server.await });

    tokio::select! {
        joined = &mut server => return finish(joined),
        () = shutdown_signal() => {}
    }

    info!(
        target = "tagport::serve",
        grace_secs = settings.server.graceful_shutdown.as_secs(),
        "shutting down"
    );
    shutdown.cancel();

    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => finish(joined),
        Err(_) => {
            warn!(
                target = "tagport::serve",
                "graceful shutdown timed out; dropping open connections"
            );
            server.abort();
            Ok(())
        }
    }
}

fn finish(joined: Result<std::io::Result<()>, tokio::task::JoinError>) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::unexpected(format!("server error: {err}"))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(target = "tagport::serve", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(target = "tagport::serve", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
