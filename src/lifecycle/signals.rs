//! OS signal handling.
//!
//! # Responsibilities
//! - Translate process signals into lifecycle calls
//! - SIGINT/SIGTERM → graceful shutdown
//! - SIGQUIT → immediate close
//! - SIGHUP/SIGUSR1/SIGUSR2 → logged, then exit with `128 + signal`
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The trap ends with the process; it is not a tracked background task
//!   because task drain must not wait for it

use crate::lifecycle::App;

/// What a trapped signal asks of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Shutdown,
    Close,
    Exit(i32),
}

/// Action for the signal numbered `signal`.
pub fn action_for(signal: i32) -> SignalAction {
    match signal {
        2 | 15 => SignalAction::Shutdown,
        3 => SignalAction::Close,
        n => SignalAction::Exit(128 + n),
    }
}

/// Start the signal loop for `app`.
pub(crate) fn trap(app: App) {
    tokio::spawn(async move {
        if let Err(e) = run(&app).await {
            tracing::error!(error = %e, "Cannot install signal handlers");
        }
    });
}

#[cfg(unix)]
async fn run(app: &App) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;

    loop {
        let kind = tokio::select! {
            _ = app.stopped() => return Ok(()),
            _ = int.recv() => SignalKind::interrupt(),
            _ = term.recv() => SignalKind::terminate(),
            _ = quit.recv() => SignalKind::quit(),
            _ = hup.recv() => SignalKind::hangup(),
            _ = usr1.recv() => SignalKind::user_defined1(),
            _ = usr2.recv() => SignalKind::user_defined2(),
        };
        let number = kind.as_raw_value();
        tracing::info!(signal = number, "Signal received");
        if dispatch(app, action_for(number)).await {
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
async fn run(app: &App) -> std::io::Result<()> {
    tokio::select! {
        _ = app.stopped() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Ctrl-C received");
            dispatch(app, SignalAction::Shutdown).await;
        }
    }
    Ok(())
}

/// Returns `true` once the process is on its way out.
async fn dispatch(app: &App, action: SignalAction) -> bool {
    match action {
        SignalAction::Shutdown => app.shutdown().await,
        SignalAction::Close => {
            app.close().await;
            true
        }
        SignalAction::Exit(code) => {
            tracing::warn!(code, "Unhandled signal, exiting");
            app.close().await;
            std::process::exit(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_signals_to_actions() {
        assert_eq!(action_for(2), SignalAction::Shutdown);
        assert_eq!(action_for(15), SignalAction::Shutdown);
        assert_eq!(action_for(3), SignalAction::Close);
        assert_eq!(action_for(1), SignalAction::Exit(129));
    }
}
