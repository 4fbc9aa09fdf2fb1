//! Ordered pattern rules mapping free-text queries to intents.
//!
//! Pure and deterministic: no store reads, no external calls. Rules are
//! evaluated in declaration order and the first match wins, which is how
//! vocabulary overlap is resolved ("layout" appears in report requests;
//! the report rule is declared first, so report wording wins).

use std::sync::LazyLock;

use regex::Regex;

use super::{Coordinates, Intent, IntentKind, IntentParams};

/// Coordinate extraction demands a decimal point in both numbers and a
/// comma between them. Capacity phrases like "30MW" or bare integers
/// never qualify.
static COORDS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(-?\d{1,3}\.\d+)\s*,\s*(-?\d{1,3}\.\d+)").unwrap());

static CAPACITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*mw\b").unwrap());

static RADIUS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*km\b").unwrap());

static WIND_SPEED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*m/s\b").unwrap());

static PROJECT_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bproject\s+([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})",
    )
    .unwrap()
});

static TURBINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([a-z]{1,8}-?\d{2,4})\s+turbines?\b").unwrap());

/// Bare continuations ("run it", "next step") that only make sense
/// against the conversation history.
static FOLLOW_UP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(run|do|start|go|continue|next|again|rerun|same)\b").unwrap()
});

/// Routing rules in priority order. More specific vocabulary first.
static RULES: LazyLock<Vec<(IntentKind, Regex)>> = LazyLock::new(|| {
    vec![
        (
            IntentKind::ProjectList,
            Regex::new(r"(?i)\b(list|show|all)\b.*\bprojects\b|\bmy projects\b").unwrap(),
        ),
        (
            IntentKind::Dashboard,
            Regex::new(r"(?i)\b(dashboard|overview|project status|where are we)\b").unwrap(),
        ),
        // Report wording beats "layout"/"simulation" mentioned inside it.
        (
            IntentKind::ReportGeneration,
            Regex::new(r"(?i)\b(report|summar(y|ize|ise)|consolidated|document)\b").unwrap(),
        ),
        (
            IntentKind::WindRose,
            Regex::new(r"(?i)\bwind[\s-]?rose\b|\bwind (resource|statistics|distribution)\b")
                .unwrap(),
        ),
        (
            IntentKind::WakeSimulation,
            Regex::new(r"(?i)\b(wake|simulat\w*|aep\b|energy (yield|production))").unwrap(),
        ),
        (
            IntentKind::LayoutOptimization,
            Regex::new(r"(?i)\b(layout|placement|arrange\w*|position\w* turbines)\b").unwrap(),
        ),
        (
            IntentKind::TerrainAnalysis,
            Regex::new(
                r"(?i)\b(terrain|suitab\w*|exclusion|slope|assess\w*|analy[sz]e\w*)\b",
            )
            .unwrap(),
        ),
    ]
});

/// Classify a query against the ordered rules.
///
/// `history` is the session's prior user queries, newest last. It is only
/// consulted for bare follow-ups ("run it again") that match no rule on
/// their own. Never fails: unmatched queries come back as `Unknown`, and
/// the orchestrator answers those with a clarifying question.
pub fn classify(query: &str, history: &[String]) -> Intent {
    let params = extract_params(query);

    if let Some(kind) = match_rules(query) {
        return Intent { kind, params };
    }

    if FOLLOW_UP_REGEX.is_match(query) {
        for earlier in history.iter().rev() {
            if let Some(kind) = match_rules(earlier) {
                return Intent { kind, params };
            }
        }
    }

    Intent {
        kind: IntentKind::Unknown,
        params,
    }
}

fn match_rules(text: &str) -> Option<IntentKind> {
    RULES
        .iter()
        .find(|(_, regex)| regex.is_match(text))
        .map(|(kind, _)| *kind)
}

fn extract_params(query: &str) -> IntentParams {
    IntentParams {
        coordinates: extract_coordinates(query),
        project_id: PROJECT_ID_REGEX
            .captures(query)
            .map(|cap| cap[1].to_lowercase()),
        radius_km: capture_f64(&RADIUS_REGEX, query),
        turbine_model: TURBINE_REGEX
            .captures(query)
            .map(|cap| cap[1].to_uppercase()),
        mean_wind_speed: capture_f64(&WIND_SPEED_REGEX, query),
        capacity_mw: capture_f64(&CAPACITY_REGEX, query),
    }
}

fn extract_coordinates(query: &str) -> Option<Coordinates> {
    let cap = COORDS_REGEX.captures(query)?;
    let lat: f64 = cap[1].parse().ok()?;
    let lon: f64 = cap[2].parse().ok()?;
    if lat.abs() > 90.0 || lon.abs() > 180.0 {
        return None;
    }
    Some(Coordinates { lat, lon })
}

fn capture_f64(regex: &Regex, query: &str) -> Option<f64> {
    regex.captures(query).and_then(|cap| cap[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_query_with_coordinates() {
        let intent = classify("optimize turbine layout for site at 40.7128,-74.0060", &[]);
        assert_eq!(intent.kind, IntentKind::LayoutOptimization);
        let coords = intent.params.coordinates.unwrap();
        assert_eq!(coords.lat, 40.7128);
        assert_eq!(coords.lon, -74.0060);
    }

    #[test]
    fn capacity_is_never_a_coordinate() {
        let intent = classify("30MW wind farm", &[]);
        assert!(intent.params.coordinates.is_none());
        assert_eq!(intent.params.capacity_mw, Some(30.0));
    }

    #[test]
    fn integer_pair_without_decimal_point_is_not_coordinates() {
        let intent = classify("analyze site 40, -74 please", &[]);
        assert!(intent.params.coordinates.is_none());
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        assert!(extract_coordinates("site at 140.5,200.1").is_none());
        assert!(extract_coordinates("site at 89.5,179.9").is_some());
    }

    #[test]
    fn report_wording_beats_layout_vocabulary() {
        let intent = classify("generate a report covering the layout and simulation", &[]);
        assert_eq!(intent.kind, IntentKind::ReportGeneration);
    }

    #[test]
    fn wind_rose_beats_generic_wind_simulation_words() {
        let intent = classify("show me the wind rose for this site", &[]);
        assert_eq!(intent.kind, IntentKind::WindRose);
    }

    #[test]
    fn wake_simulation_matches() {
        let intent = classify("run the wake simulation", &[]);
        assert_eq!(intent.kind, IntentKind::WakeSimulation);
    }

    #[test]
    fn terrain_matches_site_assessment_phrasing() {
        let intent = classify("assess terrain suitability at 52.52,13.405 within 5km", &[]);
        assert_eq!(intent.kind, IntentKind::TerrainAnalysis);
        assert_eq!(intent.params.radius_km, Some(5.0));
    }

    #[test]
    fn unmatched_query_is_unknown_not_an_error() {
        let intent = classify("what's for lunch", &[]);
        assert_eq!(intent.kind, IntentKind::Unknown);
    }

    #[test]
    fn follow_up_resolves_against_history() {
        let history = vec![
            "analyze terrain at 40.1,-74.2".to_string(),
            "optimize the turbine layout".to_string(),
        ];
        let intent = classify("run it again", &history);
        assert_eq!(intent.kind, IntentKind::LayoutOptimization);
    }

    #[test]
    fn follow_up_with_empty_history_is_unknown() {
        let intent = classify("go again", &[]);
        assert_eq!(intent.kind, IntentKind::Unknown);
    }

    #[test]
    fn project_list_and_dashboard_routes() {
        assert_eq!(classify("list my projects", &[]).kind, IntentKind::ProjectList);
        assert_eq!(
            classify("show the project dashboard", &[]).kind,
            IntentKind::Dashboard
        );
    }

    #[test]
    fn extracts_project_id_turbine_and_wind_speed() {
        let id = "0b54f4f2-9a1c-4d7e-8b3f-2c6a1d9e0f11";
        let query = format!(
            "simulate wakes for project {id} using V150 turbines at 8.5 m/s"
        );
        let intent = classify(&query, &[]);
        assert_eq!(intent.kind, IntentKind::WakeSimulation);
        assert_eq!(intent.params.project_id.as_deref(), Some(id));
        assert_eq!(intent.params.turbine_model.as_deref(), Some("V150"));
        assert_eq!(intent.params.mean_wind_speed, Some(8.5));
    }

    #[test]
    fn classification_is_deterministic() {
        let a = classify("optimize layout at 40.5,-73.9", &[]);
        let b = classify("optimize layout at 40.5,-73.9", &[]);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.params.coordinates, b.params.coordinates);
    }
}
