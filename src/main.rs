mod battery;
mod clock;
mod config;
mod connectivity;
mod led;
mod portal;
mod pt928;
mod record;
mod registration;
mod sampling;
mod sleep;
mod storage;
mod store;
mod supervisor;
mod upload;
mod urlcode;
mod wait;

#[cfg(target_os = "espidf")]
mod board;
#[cfg(not(target_os = "espidf"))]
mod sim;

// flash command:
// cargo +esp run --release --target xtensa-esp32s3-espidf -Zbuild-std=std,panic_abort

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    board::run()
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    sim::run()
}
