//! Environment image builder library.
//!
//! Turns a base rootfs plus an ordered list of provisioning steps (package
//! installs, verified remote installers, cleanups) into a deterministic,
//! layered environment image in a local store.
//!
//! ```rust,ignore
//! let recipe = Recipe::load(Path::new("recipes/rust-qemu-dev.toml"))?;
//! let mut builder = EnvironmentBuilder::new(config, store, fetcher, cancel);
//! let image = builder.build(&recipe.build_request(false)).await?;
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod fetch;
pub mod image;
pub mod preflight;
pub mod process;
pub mod rebuild;
pub mod recipe;
pub mod step;
pub mod verify;

pub use error::{BuildError, StepRef};
pub use image::{BaseImage, EnvironmentImage, ImageStore};
pub use recipe::Recipe;
pub use step::{BuildRequest, BuildState, EnvironmentBuilder, ProvisioningStep, StepKind};

use std::time::{Duration, Instant};

/// Wall-clock timer for build phases.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Print the elapsed time.
    pub fn finish(self) {
        println!("    [{}: {}]", self.label, format_duration(self.elapsed()));
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}
