use std::env;
use std::sync::OnceLock;

static GRADGRAPH_VERIFY: OnceLock<bool> = OnceLock::new();
static GRADGRAPH_PASS_STATS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn flag(cell: &OnceLock<bool>, name: &str, default: bool) -> bool {
    *cell.get_or_init(|| match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => default,
    })
}

/// Whether transforms re-verify the functions they produce. On unless
/// `GRADGRAPH_VERIFY` is set to a false value.
pub(crate) fn verify_enabled() -> bool {
    flag(&GRADGRAPH_VERIFY, "GRADGRAPH_VERIFY", true)
}

pub(crate) fn pass_stats_enabled() -> bool {
    flag(&GRADGRAPH_PASS_STATS, "GRADGRAPH_PASS_STATS", false)
}
