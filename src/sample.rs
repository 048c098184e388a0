//! Device method sample driver
//!
//! Configures a session, registers one of the sample method handlers and runs until the
//! handler has serviced a single method call.

use std::thread;
use std::time::Duration;

use crate::dispatcher::{AsyncResponseHandler, BufferResponseHandler, RunFlag};
use crate::errors::Error;
use crate::session::{
    MethodCallback, PolledSession, Session, SessionOption, DOWORK_LOOP_NUM, WORK_INTERVAL,
};
use crate::settings::HandlerKind;

/// Pause between run flag checks in threaded mode
pub const RUN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Session setup applied before the run loop starts
#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    /// Turn on protocol tracing
    pub log_trace: bool,
    /// PEM certificates to trust
    pub trusted_certs: Option<String>,
    /// Handler to register
    pub handler: HandlerKind,
}

/// Apply options and register the method handler.
///
/// Option failures are logged and ignored; a handler that cannot be registered is fatal.
pub fn configure<S: Session + ?Sized>(
    session: &mut S,
    options: &StartupOptions,
    run: &RunFlag,
) -> crate::Result<()> {
    let mut requested = vec![SessionOption::LogTrace(options.log_trace)];
    if let Some(certs) = &options.trusted_certs {
        requested.push(SessionOption::TrustedCerts(certs.clone()));
    }
    for option in requested {
        let name = option.name();
        if let Err(err) = session.set_option(option) {
            warn!("failure to set option \"{}\": {}", name, err);
        }
    }

    let callback = match options.handler {
        HandlerKind::Explicit => {
            MethodCallback::ExplicitResponse(Box::new(AsyncResponseHandler::new(run.clone())))
        }
        HandlerKind::Buffer => {
            MethodCallback::BufferReturn(Box::new(BufferResponseHandler::new(run.clone())))
        }
    };
    session
        .register_method_handler(callback)
        .map_err(|err| Error::Registration(err.to_string()))?;
    info!("Device method handler registered");
    Ok(())
}

/// Pump `session` until `run` stops, then pump [`DOWORK_LOOP_NUM`] more times to flush
/// pending sends. The caller destroys the session afterwards.
pub fn run_polled<S: PolledSession + ?Sized>(
    session: &mut S,
    options: &StartupOptions,
    run: &RunFlag,
) -> crate::Result<()> {
    configure(session, options, run)?;

    loop {
        session.do_work();
        thread::sleep(WORK_INTERVAL);
        if !run.is_running() {
            break;
        }
    }

    info!(
        "Device method run finished, pumping {} more times to complete final sending",
        DOWORK_LOOP_NUM
    );
    for _ in 0..DOWORK_LOOP_NUM {
        session.do_work();
        thread::sleep(WORK_INTERVAL);
    }
    Ok(())
}

/// Wait until `run` stops while the session's own worker drives I/O
pub fn run_threaded<S: Session + ?Sized>(
    session: &mut S,
    options: &StartupOptions,
    run: &RunFlag,
) -> crate::Result<()> {
    configure(session, options, run)?;

    while run.is_running() {
        thread::sleep(RUN_CHECK_INTERVAL);
    }
    info!("Device method run finished");
    Ok(())
}

#[cfg(feature = "mqtt-session")]
fn wait_for_key() {
    use std::io::BufRead;

    info!("Press Enter to close the session");
    let mut line = String::new();
    if let Err(err) = std::io::stdin().lock().read_line(&mut line) {
        warn!("Failed to read from stdin: {}", err);
    }
}

/// Run the sample end to end with the MQTT session
#[cfg(feature = "mqtt-session")]
pub fn run(settings: &crate::settings::SampleSettings) -> crate::Result<()> {
    use crate::session::{create_session, create_threaded_session};
    use crate::settings::RunMode;

    let trusted_certs = match &settings.trusted_certs {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(pem) => Some(pem),
            Err(err) => {
                warn!("failure to read trusted certificates {}: {}", path.display(), err);
                None
            }
        },
        None => None,
    };
    let options = StartupOptions {
        log_trace: settings.log_trace,
        trusted_certs,
        handler: settings.handler,
    };
    let run = RunFlag::new();

    match settings.mode {
        RunMode::Polled => {
            let mut session = create_session(&settings.connection_string, settings.protocol)?;
            run_polled(&mut session, &options, &run)?;
            if settings.wait_for_key {
                wait_for_key();
            }
        }
        RunMode::Threaded => {
            let mut session =
                create_threaded_session(&settings.connection_string, settings.protocol)?;
            run_threaded(&mut session, &options, &run)?;
            if settings.wait_for_key {
                wait_for_key();
            }
        }
    }
    Ok(())
}
