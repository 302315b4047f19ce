// On Windows, use the "windows" subsystem so no console window appears.
#![cfg_attr(windows, windows_subsystem = "windows")]

/// vlaunch GUI – egui/eframe window around the launcher.

#[cfg(feature = "gui")]
mod gui {
    use anyhow::Result;
    use eframe::egui;
    use std::path::Path;
    use std::time::Duration;
    use tracing::info;
    use vlaunch_core::{BinaryStatus, Launcher, LauncherSettings, ProcessStatus};

    /// Status is polled, so keep frames coming while idle.
    const REFRESH: Duration = Duration::from_millis(250);

    // -----------------------------------------------------------------------
    // App state
    // -----------------------------------------------------------------------

    pub struct VLaunchApp {
        launcher: Launcher,
        proxy_input: String,
        config_text: String,
        config_loaded: bool,
        last_error: Option<String>,
        logs_visible: bool,

        // Declared last so it outlives the launcher during drop.
        rt: tokio::runtime::Runtime,
    }

    impl VLaunchApp {
        fn new(rt: tokio::runtime::Runtime, settings: LauncherSettings) -> Result<Self> {
            let proxy_input = settings.proxy_url.clone();
            let launcher = Launcher::new(settings, rt.handle().clone())?;
            launcher.probe_binary();
            Ok(VLaunchApp {
                launcher,
                proxy_input,
                config_text: String::new(),
                config_loaded: false,
                last_error: None,
                logs_visible: true,
                rt,
            })
        }

        fn reload_config(&mut self) {
            match self.launcher.reload_config() {
                Ok(text) => {
                    self.config_text = text;
                    self.config_loaded = true;
                    self.last_error = None;
                }
                Err(e) => self.last_error = Some(format!("Error loading config: {}", e)),
            }
        }

        fn start(&mut self) {
            match self.rt.block_on(self.launcher.start()) {
                Ok(_) => self.last_error = None,
                Err(e) => self.last_error = Some(e.to_string()),
            }
        }

        fn download(&mut self) {
            self.launcher.set_proxy_url(&self.proxy_input);
            // Outcome is reported through the binary status and the event log.
            let _ = self.launcher.begin_fetch();
        }
    }

    impl eframe::App for VLaunchApp {
        fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
            let process = self.launcher.reconcile();

            // ---- Top menu bar ----
            egui::TopBottomPanel::top("menu_bar").show(ctx, |ui| {
                egui::menu::bar(ui, |ui| {
                    ui.menu_button("File", |ui| {
                        if ui.button("Reload Config").clicked() {
                            self.reload_config();
                            ui.close_menu();
                        }
                        ui.checkbox(&mut self.logs_visible, "Show Logs");
                        ui.separator();
                        if ui.button("Quit").clicked() {
                            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
                        }
                    });
                    ui.menu_button("Help", |ui| {
                        if ui.button("About vlaunch").clicked() {
                            self.launcher
                                .events()
                                .info(&format!("vlaunch v{} – V2Ray launcher", env!("CARGO_PKG_VERSION")));
                            ui.close_menu();
                        }
                    });
                });
            });

            // ---- Logs ----
            if self.logs_visible {
                egui::TopBottomPanel::bottom("logs")
                    .resizable(true)
                    .default_height(140.0)
                    .show(ctx, |ui| self.show_logs(ui));
            }

            // ---- Main content ----
            egui::CentralPanel::default().show(ctx, |ui| match self.launcher.binary_status() {
                BinaryStatus::Unknown => {
                    ui.label("Initializing…");
                }
                BinaryStatus::Downloading => {
                    ui.horizontal(|ui| {
                        ui.add(egui::Spinner::new());
                        ui.label("Downloading V2Ray…");
                    });
                }
                BinaryStatus::Complete => self.show_controls(ui, process),
                missing => self.show_missing(ui, &missing),
            });

            ctx.request_repaint_after(REFRESH);
        }
    }

    impl Drop for VLaunchApp {
        fn drop(&mut self) {
            self.rt.block_on(self.launcher.shutdown());
        }
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    impl VLaunchApp {
        fn show_missing(&mut self, ui: &mut egui::Ui, status: &BinaryStatus) {
            ui.heading("V2Ray Not Found");
            ui.separator();

            if let BinaryStatus::DownloadError { message, .. } = status {
                ui.colored_label(egui::Color32::RED, message);
            }

            egui::Grid::new("download_grid")
                .num_columns(2)
                .spacing([20.0, 8.0])
                .show(ui, |ui| {
                    ui.label("Binary path:");
                    ui.label(self.launcher.settings().binary_path.display().to_string());
                    ui.end_row();

                    ui.label("Proxy (optional):");
                    ui.add(
                        egui::TextEdit::singleline(&mut self.proxy_input)
                            .hint_text("socks5://127.0.0.1:1080"),
                    );
                    ui.end_row();
                });

            if ui.button("Download").clicked() {
                self.download();
            }
        }

        fn show_controls(&mut self, ui: &mut egui::Ui, process: ProcessStatus) {
            if !self.config_loaded {
                self.reload_config();
            }

            ui.horizontal(|ui| {
                match process {
                    ProcessStatus::Running { pid, .. } => {
                        if ui.button("Stop").clicked() {
                            self.launcher.stop();
                        }
                        ui.colored_label(egui::Color32::GREEN, format!("Running (pid {})", pid));
                    }
                    ProcessStatus::Stopped { .. } => {
                        if ui.button("Start").clicked() {
                            self.start();
                        }
                        ui.label("Stopped");
                    }
                }
                if let Some(code) = process.failure() {
                    ui.colored_label(egui::Color32::RED, format!("Failed to launch V2Ray: {}", code));
                }
            });
            if let Some(err) = &self.last_error {
                ui.colored_label(egui::Color32::RED, err);
            }
            ui.separator();

            ui.label(format!("Config: {}", self.launcher.settings().config_path.display()));
            egui::ScrollArea::vertical().show(ui, |ui| {
                let editor = ui.add(
                    egui::TextEdit::multiline(&mut self.config_text)
                        .code_editor()
                        .desired_rows(20)
                        .desired_width(f32::INFINITY),
                );
                if editor.changed() {
                    if let Err(e) = self.launcher.save_config(&self.config_text) {
                        self.last_error = Some(format!("Error saving config: {}", e));
                    }
                }
            });
        }

        fn show_logs(&mut self, ui: &mut egui::Ui) {
            ui.strong("Logs");
            egui::ScrollArea::vertical()
                .auto_shrink([false, false])
                .stick_to_bottom(true)
                .show(ui, |ui| {
                    for entry in self.launcher.events().recent() {
                        ui.label(entry.display_line());
                    }
                });
        }
    }

    // -----------------------------------------------------------------------
    // Entry
    // -----------------------------------------------------------------------

    pub fn run(settings_path: &Path, settings: LauncherSettings) -> Result<()> {
        info!(settings = %settings_path.display(), "Starting vlaunch GUI");

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let app = VLaunchApp::new(rt, settings)?;

        let options = eframe::NativeOptions {
            viewport: egui::ViewportBuilder::default()
                .with_title("vlaunch")
                .with_inner_size([720.0, 560.0]),
            ..Default::default()
        };
        eframe::run_native("vlaunch", options, Box::new(|_cc| Ok(Box::new(app))))
            .map_err(|e| anyhow::anyhow!("GUI failed: {}", e))
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "vlaunch-gui", about = "vlaunch – V2Ray launcher window")]
struct Cli {
    /// Path to the XML settings file
    #[arg(short, long, default_value = "vlaunch.xml")]
    settings: std::path::PathBuf,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

/// `-v` wins; otherwise the settings' level, falling back to info when it
/// is not a valid filter.
fn env_filter(verbose: bool, level: &str) -> EnvFilter {
    let filter = if verbose { "debug" } else { level };
    EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing(verbose: bool, level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose, level))
        .init();
}

#[cfg(feature = "gui")]
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The log level lives in the settings, so they load before tracing is up.
    let settings = vlaunch_core::LauncherSettings::load_or_default(&cli.settings);
    init_tracing(cli.verbose, &settings.log_level);
    gui::run(&cli.settings, settings)
}

#[cfg(not(feature = "gui"))]
fn main() {
    let cli = Cli::parse();
    let settings = vlaunch_core::LauncherSettings::load_or_default(&cli.settings);
    init_tracing(cli.verbose, &settings.log_level);
    tracing::error!(settings = %cli.settings.display(), "GUI not available");
    eprintln!("vlaunch GUI was compiled without the 'gui' feature. Rebuild with --features gui.");
    std::process::exit(1);
}
