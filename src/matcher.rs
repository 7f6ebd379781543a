use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::Serialize;
use strsim::jaro_winkler;
use tracing::trace;

use crate::catalog::{CatalogLookup, CatalogPlace};
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::provider::ProviderPlace;

const NAME_WEIGHT: f64 = 0.7;
const ADDRESS_WEIGHT: f64 = 0.2;
const PROXIMITY_WEIGHT: f64 = 0.1;
// Two name tokens count as the same word above this similarity.
const TOKEN_MATCH_THRESHOLD: f64 = 0.92;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MatchDecision {
    New,
    UpdateExisting { target_id: i64 },
    SkipDuplicate { existing_id: i64 },
}

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub decision: MatchDecision,
    /// The catalog record the decision points at, if any.
    pub existing: Option<CatalogPlace>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchSettings {
    pub radius_meters: f64,
    pub threshold: f64,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            radius_meters: 100.0,
            threshold: 0.85,
        }
    }
}

impl From<&AppConfig> for MatchSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            radius_meters: config.match_radius_meters,
            threshold: config.match_threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Matcher {
    settings: MatchSettings,
}

impl Matcher {
    pub fn new(settings: MatchSettings) -> Self {
        Self { settings }
    }

    /// Exact (provider, external id) first, then the best fuzzy candidate
    /// nearby. Ties go to the smallest catalog id.
    pub fn decide(
        &self,
        provider: &str,
        place: &ProviderPlace,
        catalog: &dyn CatalogLookup,
    ) -> AppResult<MatchOutcome> {
        if let Some(existing) = catalog.find_by_external_id(provider, &place.external_id)? {
            return Ok(MatchOutcome {
                decision: MatchDecision::UpdateExisting {
                    target_id: existing.id,
                },
                existing: Some(existing),
                score: None,
            });
        }

        let candidates = catalog.find_near(place.coordinate, self.settings.radius_meters)?;
        let best = candidates
            .into_iter()
            .map(|candidate| (self.score(place, &candidate), candidate))
            .inspect(|(score, candidate)| {
                trace!(
                    external_id = %place.external_id,
                    candidate_id = candidate.id,
                    score,
                    "fuzzy candidate scored"
                )
            })
            .filter(|(score, _)| *score > self.settings.threshold)
            .min_by(|(score_a, a), (score_b, b)| {
                score_b
                    .partial_cmp(score_a)
                    .unwrap_or(Ordering::Equal)
                    .then(a.id.cmp(&b.id))
            });

        Ok(match best {
            Some((score, existing)) => MatchOutcome {
                decision: MatchDecision::SkipDuplicate {
                    existing_id: existing.id,
                },
                existing: Some(existing),
                score: Some(score),
            },
            None => MatchOutcome {
                decision: MatchDecision::New,
                existing: None,
                score: None,
            },
        })
    }

    /// Weighted blend of name similarity, address-token overlap and distance.
    /// Without an address on both sides its weight moves to the name.
    pub fn score(&self, place: &ProviderPlace, candidate: &CatalogPlace) -> f64 {
        let name = name_similarity(&place.name, &candidate.fields.name);
        let distance = place
            .coordinate
            .distance_meters(&candidate.fields.coordinate);
        let proximity = (1.0 - distance / self.settings.radius_meters).clamp(0.0, 1.0);

        let address = match (
            place.formatted_address.as_deref(),
            candidate.fields.formatted_address.as_deref(),
        ) {
            (Some(a), Some(b)) => address_overlap(a, b),
            _ => None,
        };

        match address {
            Some(overlap) => {
                NAME_WEIGHT * name + ADDRESS_WEIGHT * overlap + PROXIMITY_WEIGHT * proximity
            }
            None => (NAME_WEIGHT + ADDRESS_WEIGHT) * name + PROXIMITY_WEIGHT * proximity,
        }
    }
}

/// Lowercased, accent-folded words with punctuation removed.
pub fn normalize_tokens(input: &str) -> Vec<String> {
    let folded: String = input
        .chars()
        .flat_map(char::to_lowercase)
        .map(fold_accent)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().map(str::to_string).collect()
}

fn fold_accent(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ä' | 'ã' | 'å' => 'a',
        'ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'ö' | 'õ' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

/// Word-order-insensitive similarity in `[0, 1]`: half Jaro-Winkler over the
/// sorted words, half soft Dice overlap of the word sets.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let mut tokens_a = normalize_tokens(a);
    let mut tokens_b = normalize_tokens(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    tokens_a.sort();
    tokens_b.sort();

    let sorted = jaro_winkler(&tokens_a.join(" "), &tokens_b.join(" "));
    let matched = tokens_a
        .iter()
        .filter(|ta| {
            tokens_b
                .iter()
                .any(|tb| jaro_winkler(ta, tb) >= TOKEN_MATCH_THRESHOLD)
        })
        .count();
    let dice = (2 * matched) as f64 / (tokens_a.len() + tokens_b.len()) as f64;
    (0.5 * sorted + 0.5 * dice.min(1.0)).clamp(0.0, 1.0)
}

/// Jaccard overlap of address words; `None` when either side has none.
pub fn address_overlap(a: &str, b: &str) -> Option<f64> {
    let tokens_a: BTreeSet<String> = normalize_tokens(a).into_iter().collect();
    let tokens_b: BTreeSet<String> = normalize_tokens(b).into_iter().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return None;
    }
    let shared = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    Some(shared as f64 / union as f64)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;
    use crate::catalog::{Coordinate, OwnershipStatus, PlaceFields, PlaceSource};
    use crate::errors::AppError;

    struct VecCatalog(Vec<CatalogPlace>);

    impl CatalogLookup for VecCatalog {
        fn find_by_external_id(
            &self,
            provider: &str,
            external_id: &str,
        ) -> AppResult<Option<CatalogPlace>> {
            Ok(self
                .0
                .iter()
                .find(|p| {
                    p.provider.as_deref() == Some(provider)
                        && p.external_id.as_deref() == Some(external_id)
                })
                .cloned())
        }

        fn find_near(
            &self,
            center: Coordinate,
            radius_meters: f64,
        ) -> AppResult<Vec<CatalogPlace>> {
            Ok(self
                .0
                .iter()
                .filter(|p| p.fields.coordinate.distance_meters(&center) <= radius_meters)
                .cloned()
                .collect())
        }
    }

    struct FailingCatalog;

    impl CatalogLookup for FailingCatalog {
        fn find_by_external_id(&self, _: &str, _: &str) -> AppResult<Option<CatalogPlace>> {
            Err(AppError::Config("catalog offline".into()))
        }

        fn find_near(&self, _: Coordinate, _: f64) -> AppResult<Vec<CatalogPlace>> {
            Ok(Vec::new())
        }
    }

    fn catalog_place(id: i64, external_id: Option<&str>, name: &str, lat: f64, lng: f64) -> CatalogPlace {
        CatalogPlace {
            id,
            provider: external_id.map(|_| "google_places".to_string()),
            external_id: external_id.map(str::to_string),
            fields: PlaceFields {
                name: name.into(),
                formatted_address: None,
                coordinate: Coordinate { lat, lng },
                categories: BTreeSet::new(),
                rating: None,
                rating_count: 0,
                price_level: None,
                operational_status: None,
                photo_urls: Vec::new(),
            },
            source: if external_id.is_some() {
                PlaceSource::ProviderImport
            } else {
                PlaceSource::Manual
            },
            imported_at: Utc::now(),
            updated_at: Utc::now(),
            status: OwnershipStatus::Imported,
            claim: None,
            verification: None,
            version: 0,
        }
    }

    fn provider_place(external_id: &str, name: &str, lat: f64, lng: f64) -> ProviderPlace {
        ProviderPlace {
            external_id: external_id.into(),
            name: name.into(),
            formatted_address: None,
            coordinate: Coordinate { lat, lng },
            categories: BTreeSet::new(),
            rating: None,
            rating_count: 0,
            price_level: None,
            operational_status: None,
            photo_refs: Vec::new(),
        }
    }

    fn matcher() -> Matcher {
        Matcher::new(MatchSettings::default())
    }

    #[test]
    fn exact_external_id_wins() {
        let catalog = VecCatalog(vec![catalog_place(7, Some("A"), "Old name", 5.36, -4.0)]);
        let outcome = matcher()
            .decide("google_places", &provider_place("A", "Totally different", 5.40, -4.1), &catalog)
            .unwrap();
        assert_eq!(outcome.decision, MatchDecision::UpdateExisting { target_id: 7 });
    }

    #[test]
    fn reordered_name_nearby_is_a_duplicate() {
        let catalog = VecCatalog(vec![catalog_place(
            3,
            Some("baobab-1"),
            "Restaurant Le Baobab",
            5.3600,
            -4.0083,
        )]);
        let outcome = matcher()
            .decide(
                "google_places",
                &provider_place("baobab-2", "Le Baobab Restaurant", 5.3601, -4.0084),
                &catalog,
            )
            .unwrap();
        assert_eq!(outcome.decision, MatchDecision::SkipDuplicate { existing_id: 3 });
        assert_eq!(outcome.existing.unwrap().external_id.as_deref(), Some("baobab-1"));
    }

    #[test]
    fn manual_entries_are_protected() {
        let catalog = VecCatalog(vec![catalog_place(4, None, "Maquis Chez Tantie", 5.35, -4.02)]);
        let outcome = matcher()
            .decide(
                "google_places",
                &provider_place("tantie", "Maquis chez Tantie", 5.35005, -4.02),
                &catalog,
            )
            .unwrap();
        assert_eq!(outcome.decision, MatchDecision::SkipDuplicate { existing_id: 4 });
    }

    #[test]
    fn different_names_or_far_away_are_new() {
        let catalog = VecCatalog(vec![
            catalog_place(1, Some("x"), "Bar X", 5.36, -4.0),
            catalog_place(2, Some("far"), "Bar Y", 5.40, -4.0),
        ]);
        let m = matcher();
        let distinct = m
            .decide("google_places", &provider_place("y", "Bar Y", 5.3601, -4.0001), &catalog)
            .unwrap();
        assert_eq!(distinct.decision, MatchDecision::New);

        let far = m
            .decide("google_places", &provider_place("x2", "Bar X", 5.37, -4.0), &catalog)
            .unwrap();
        assert_eq!(far.decision, MatchDecision::New);
    }

    #[test]
    fn ties_go_to_the_smallest_id() {
        let catalog = VecCatalog(vec![
            catalog_place(9, Some("n9"), "Bar X", 5.3601, -4.0),
            catalog_place(5, Some("n5"), "Bar X", 5.3601, -4.0),
        ]);
        let outcome = matcher()
            .decide("google_places", &provider_place("new", "Bar X", 5.36, -4.0), &catalog)
            .unwrap();
        assert_eq!(outcome.decision, MatchDecision::SkipDuplicate { existing_id: 5 });
    }

    #[test]
    fn higher_score_beats_smaller_id() {
        let catalog = VecCatalog(vec![
            catalog_place(1, Some("n1"), "Bar X Lounge", 5.3604, -4.0),
            catalog_place(2, Some("n2"), "Bar X Lounge", 5.36, -4.0),
        ]);
        let outcome = matcher()
            .decide("google_places", &provider_place("new", "Bar X Lounge", 5.36, -4.0), &catalog)
            .unwrap();
        assert_eq!(outcome.decision, MatchDecision::SkipDuplicate { existing_id: 2 });
    }

    #[test]
    fn threshold_is_configurable() {
        let catalog = VecCatalog(vec![catalog_place(1, Some("n1"), "Bar X", 5.36, -4.0)]);
        let strict = Matcher::new(MatchSettings {
            radius_meters: 100.0,
            threshold: 1.0,
        });
        let outcome = strict
            .decide("google_places", &provider_place("new", "Bar X", 5.3601, -4.0), &catalog)
            .unwrap();
        assert_eq!(outcome.decision, MatchDecision::New);
    }

    #[test]
    fn propagates_lookup_failures() {
        let result = matcher().decide("google_places", &provider_place("a", "Bar", 5.0, -4.0), &FailingCatalog);
        assert!(result.is_err());
    }

    #[test]
    fn name_similarity_ignores_order_case_and_accents() {
        assert!((name_similarity("Café Mozart", "cafe MOZART") - 1.0).abs() < 1e-9);
        assert!((name_similarity("Restaurant Le Baobab", "Le Baobab Restaurant") - 1.0).abs() < 1e-9);
        assert!(name_similarity("Bar X", "Bar Y") < 0.8);
        assert_eq!(name_similarity("", "Bar"), 0.0);
    }

    #[test]
    fn address_overlap_needs_both_sides() {
        assert_eq!(address_overlap("", "Rue 12"), None);
        let overlap = address_overlap("Rue des Jardins, Abidjan", "rue des jardins abidjan").unwrap();
        assert!((overlap - 1.0).abs() < 1e-9);
    }
}
