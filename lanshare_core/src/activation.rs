//! `lanshare://` activation links.
//!
//! `lanshare://192.168.1.20` and `lanshare://open?target=192.168.1.20` both
//! preselect 192.168.1.20 as the send target. The `target` query parameter
//! wins over the host part.

use crate::config::{AppSettings, SettingsService};
use crate::error::Result;
use url::Url;

pub const ACTIVATION_SCHEME: &str = "lanshare";

/// Target named by an activation link, if `link` is one
pub fn parse_activation_target(link: &str) -> Option<String> {
    let link = link.trim();
    if !is_activation_argument(link) {
        return None;
    }

    let url = Url::parse(link).ok()?;
    if !url.scheme().eq_ignore_ascii_case(ACTIVATION_SCHEME) {
        return None;
    }

    let from_query = url
        .query_pairs()
        .find(|(key, _)| key.eq_ignore_ascii_case("target"))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty());
    if from_query.is_some() {
        return from_query;
    }

    url.host_str()
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
}

/// Save the target of the first activation link in `args`.
///
/// Returns `false` without touching settings when no argument is a usable
/// link.
pub fn apply_activation<S: AsRef<str>>(settings: &dyn SettingsService, args: &[S]) -> Result<bool> {
    let Some(link) = args
        .iter()
        .map(AsRef::as_ref)
        .find(|arg| is_activation_argument(arg))
    else {
        return Ok(false);
    };

    let Some(target) = parse_activation_target(link) else {
        tracing::debug!("Ignoring malformed activation link {}", link);
        return Ok(false);
    };

    tracing::info!("Activation link selects {}", target);
    settings.update(&mut |s: &mut AppSettings| {
        s.last_selected_target = Some(target.clone());
    })?;
    Ok(true)
}

fn is_activation_argument(arg: &str) -> bool {
    let scheme = format!("{}://", ACTIVATION_SCHEME);
    arg.get(..scheme.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(&scheme))
}
