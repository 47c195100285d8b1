#![forbid(unsafe_code)]

use anyhow::Context;
use tracing::info;
use url::Url;

use crate::BrowserLauncher;

/// Launches the desktop's default browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
	fn open(&self, url: &Url) -> anyhow::Result<()> {
		info!(host = url.host_str().unwrap_or_default(), "opening browser for authorization");
		open::that(url.as_str()).context("open browser")
	}
}
