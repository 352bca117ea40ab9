use std::{thread, time::Duration};

use castqueue::{
    config::{default_config_path, load_or_create_config, Config},
    media::ListKind,
    renderer_discovery::MdnsRendererDiscoverer,
    renderer_registry::{DiscovererFactory, RendererDiscoverer, RendererRegistry},
    settings_store::SettingsStore,
};
use log::{info, warn};
use tokio::sync::broadcast;

fn load_config() -> Config {
    match default_config_path().and_then(|path| load_or_create_config(&path)) {
        Ok(config) => config,
        Err(err) => {
            warn!("Failed to load config, using defaults: {}", err);
            Config::default()
        }
    }
}

fn report_renderers(config: &Config) {
    let (bus_sender, _) = broadcast::channel(1024);
    let service_type = config.renderer.service_type.clone();
    let factory: DiscovererFactory = Box::new(move || {
        vec![Box::new(MdnsRendererDiscoverer::new(service_type.clone())) as Box<dyn RendererDiscoverer>]
    });
    let renderers = RendererRegistry::new(bus_sender, &config.renderer, factory);

    info!(
        "Browsing {} for {} ms",
        config.renderer.service_type, config.renderer.discovery_window_ms
    );
    renderers.start();
    thread::sleep(Duration::from_millis(config.renderer.discovery_window_ms));
    let found = renderers.renderers();
    renderers.shutdown();

    println!("Renderers ({}):", found.len());
    for renderer in found {
        println!("  {} [{}:{}] {}", renderer, renderer.address, renderer.port, renderer.model);
    }
}

fn report_saved_playlists(settings: &SettingsStore) {
    for kind in [ListKind::Media, ListKind::Audio] {
        let items = match settings.load_media_list(kind) {
            Ok(Some(items)) => items,
            Ok(None) => {
                println!("{:?} playlist: none saved", kind);
                continue;
            }
            Err(err) => {
                warn!("Failed to read saved {:?} playlist: {}", kind, err);
                continue;
            }
        };
        let position = match settings.load_position(kind) {
            Ok(position) => position,
            Err(err) => {
                warn!("Failed to read saved {:?} position: {}", kind, err);
                continue;
            }
        };
        println!(
            "{:?} playlist: {} item(s), index={} time={}ms shuffle={} repeat={:?}",
            kind,
            items.len(),
            position.index,
            position.time_ms,
            position.shuffle,
            position.repeat_mode
        );
        if let Some(current) = items.get(position.index) {
            println!("  current: {}", current.title);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Debug);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config = load_config();
    report_renderers(&config);

    let settings = SettingsStore::new()?;
    report_saved_playlists(&settings);
    Ok(())
}
