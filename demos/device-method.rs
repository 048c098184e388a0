#[macro_use]
extern crate log;

use iothub_device_method::{sample, settings::SampleSettings};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dotenv::dotenv().ok();

    let settings = match SampleSettings::load() {
        Ok(settings) => settings,
        Err(err) => {
            error!(
                "Set DEVICE_METHOD_CONNECTION_STRING or provide a device-method settings file: {}",
                err
            );
            std::process::exit(1);
        }
    };

    info!(
        "Starting device method sample ({:?} mode, {:?} handler), version {}",
        settings.mode,
        settings.handler,
        iothub_device_method::SDK_VERSION
    );

    if let Err(err) = sample::run(&settings) {
        error!("Device method sample failed: {}", err);
        std::process::exit(1);
    }
}
