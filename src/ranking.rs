//! Ranking parser and aggregation for stage 2.
//!
//! Raters are told to end with a `FINAL RANKING:` section containing a
//! numbered list of `Response <LETTER>` labels. The parser degrades
//! gracefully: numbered entries in the section, then any labels in the
//! section in order, then any labels anywhere in the text.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;

use crate::artifacts::{AggregateRank, PanelResponse, RankingBallot};

/// Section header the ranking prompt demands, verbatim.
pub const FINAL_RANKING_HEADER: &str = "FINAL RANKING:";

static NUMBERED_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\s*Response [A-Z]").expect("numbered label regex"));
static BARE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Response [A-Z]").expect("bare label regex"));

/// Anonymous label for the response at position `index` (0-based): `Response A`,
/// `Response B`, ...
pub fn response_label(index: usize) -> String {
    let letter = (b'A' + (index as u8).min(25)) as char;
    format!("Response {letter}")
}

/// Map anonymous labels to endpoint identifiers, in presentation order.
pub fn label_table(responses: &[PanelResponse]) -> BTreeMap<String, String> {
    responses
        .iter()
        .enumerate()
        .map(|(i, r)| (response_label(i), r.model.clone()))
        .collect()
}

/// Parse the ordered label list out of a rater's reply.
///
/// After the `FINAL RANKING:` header, numbered entries win; failing that, any
/// `Response X` occurrences in the section in order; with no header at all,
/// any occurrences in the whole text. Empty text parses to an empty list.
pub fn parse_ranking(text: &str) -> Vec<String> {
    if let Some(pos) = text.find(FINAL_RANKING_HEADER) {
        let section = &text[pos + FINAL_RANKING_HEADER.len()..];
        let numbered: Vec<String> = NUMBERED_LABEL
            .find_iter(section)
            .filter_map(|m| BARE_LABEL.find(m.as_str()).map(|l| l.as_str().to_string()))
            .collect();
        if !numbered.is_empty() {
            return numbered;
        }
        return BARE_LABEL
            .find_iter(section)
            .map(|m| m.as_str().to_string())
            .collect();
    }

    BARE_LABEL
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Build a ballot from one rater's raw reply.
pub fn ballot_from_reply(model: &str, reply: String) -> RankingBallot {
    let parsed_ranking = parse_ranking(&reply);
    RankingBallot {
        model: model.to_string(),
        ranking: reply,
        parsed_ranking,
    }
}

/// Mean rank position per panelist across all ballots, sorted ascending
/// (lower is better). Panelists never mentioned in any ballot are omitted.
pub fn aggregate_rankings(
    ballots: &[RankingBallot],
    label_to_model: &BTreeMap<String, String>,
) -> Vec<AggregateRank> {
    let mut positions: HashMap<&str, Vec<usize>> = HashMap::new();

    for ballot in ballots {
        for (position, label) in parse_ranking(&ballot.ranking).iter().enumerate() {
            if let Some(model) = label_to_model.get(label) {
                positions.entry(model.as_str()).or_default().push(position + 1);
            }
        }
    }

    let mut aggregate: Vec<AggregateRank> = positions
        .into_iter()
        .map(|(model, ranks)| {
            let avg = ranks.iter().sum::<usize>() as f64 / ranks.len() as f64;
            AggregateRank {
                model: model.to_string(),
                average_rank: (avg * 100.0).round() / 100.0,
                rankings_count: ranks.len(),
            }
        })
        .collect();

    aggregate.sort_by(|a, b| {
        a.average_rank
            .partial_cmp(&b.average_rank)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.model.cmp(&b.model))
    });
    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(l, m)| (l.to_string(), m.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_numbered_ranking() {
        let text = "Response A is thorough...\nResponse B is shallow...\n\n\
                    FINAL RANKING:\n1. Response X\n2. Response Y\n3. Response Z\n";
        assert_eq!(
            parse_ranking(text),
            vec!["Response X", "Response Y", "Response Z"]
        );
    }

    #[test]
    fn test_parse_header_without_numbers_falls_back_to_labels() {
        let text = "FINAL RANKING:\nBest is Response B, then Response A.";
        assert_eq!(parse_ranking(text), vec!["Response B", "Response A"]);
    }

    #[test]
    fn test_parse_no_header_scans_whole_text() {
        let text = "I prefer Response C over Response A over Response B.";
        assert_eq!(
            parse_ranking(text),
            vec!["Response C", "Response A", "Response B"]
        );
    }

    #[test]
    fn test_parse_empty_text() {
        assert!(parse_ranking("").is_empty());
    }

    #[test]
    fn test_discussion_labels_before_header_ignored() {
        let text = "Response A does X well. Response B misses Y.\n\
                    FINAL RANKING:\n1. Response B\n2. Response A";
        assert_eq!(parse_ranking(text), vec!["Response B", "Response A"]);
    }

    #[test]
    fn test_response_labels() {
        assert_eq!(response_label(0), "Response A");
        assert_eq!(response_label(2), "Response C");
    }

    #[test]
    fn test_label_table_order() {
        let responses = vec![
            PanelResponse {
                model: "m1".into(),
                response: "r1".into(),
                refined: false,
            },
            PanelResponse {
                model: "m2".into(),
                response: "r2".into(),
                refined: false,
            },
        ];
        let t = label_table(&responses);
        assert_eq!(t["Response A"], "m1");
        assert_eq!(t["Response B"], "m2");
    }

    #[test]
    fn test_aggregate_mean_rank_sorted_ascending() {
        let labels = table(&[
            ("Response A", "m1"),
            ("Response B", "m2"),
            ("Response C", "m3"),
        ]);
        let ballots: Vec<RankingBallot> = [
            "FINAL RANKING:\n1. Response A\n2. Response B\n3. Response C",
            "FINAL RANKING:\n1. Response B\n2. Response A\n3. Response C",
            "FINAL RANKING:\n1. Response A\n2. Response C\n3. Response B",
        ]
        .iter()
        .enumerate()
        .map(|(i, text)| ballot_from_reply(&format!("rater{i}"), text.to_string()))
        .collect();

        let aggregate = aggregate_rankings(&ballots, &labels);
        assert_eq!(aggregate.len(), 3);
        assert_eq!(aggregate[0].model, "m1");
        assert_eq!(aggregate[0].average_rank, 1.33);
        assert_eq!(aggregate[1].model, "m2");
        assert_eq!(aggregate[1].average_rank, 1.67);
        assert_eq!(aggregate[2].model, "m3");
        assert_eq!(aggregate[2].average_rank, 2.67);
        assert!(aggregate.iter().all(|a| a.rankings_count == 3));
    }

    #[test]
    fn test_aggregate_ignores_unknown_labels() {
        let labels = table(&[("Response A", "m1")]);
        let ballots = vec![ballot_from_reply(
            "rater",
            "FINAL RANKING:\n1. Response Q\n2. Response A".to_string(),
        )];
        let aggregate = aggregate_rankings(&ballots, &labels);
        assert_eq!(aggregate.len(), 1);
        assert_eq!(aggregate[0].model, "m1");
        assert_eq!(aggregate[0].average_rank, 2.0);
    }
}
