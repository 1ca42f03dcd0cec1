use tabled::{settings::Style, Table, Tabled};

use crate::model::AnalysisSummary;
use crate::storage::StoreStats;
use crate::ui::human_bytes;

#[derive(Tabled)]
struct AnalysisRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Title")]
    title: String,
    #[tabled(rename = "Saved (ms)")]
    time: i64,
}

#[derive(Tabled)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

/// Analyses sorted by save time; empty string when there are none
pub fn analyses_table(summaries: &[AnalysisSummary]) -> String {
    if summaries.is_empty() {
        return String::new();
    }

    let mut rows: Vec<AnalysisRow> = summaries
        .iter()
        .map(|s| AnalysisRow {
            id: s.id.clone(),
            title: s.title.clone(),
            time: s.time,
        })
        .collect();
    rows.sort_by_key(|r| r.time);

    Table::new(&rows).with(Style::rounded()).to_string()
}

pub fn stats_table(stats: &StoreStats) -> String {
    let rows = vec![
        MetricRow {
            metric: "Analyses",
            value: stats.analyses.to_string(),
        },
        MetricRow {
            metric: "Analysis payloads",
            value: human_bytes(stats.analysis_bytes),
        },
        MetricRow {
            metric: "Files",
            value: stats.files.to_string(),
        },
        MetricRow {
            metric: "File payloads",
            value: human_bytes(stats.file_bytes),
        },
        MetricRow {
            metric: "References",
            value: stats.references.to_string(),
        },
    ];

    Table::new(&rows).with(Style::rounded()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_analyses_table() {
        assert!(analyses_table(&[]).is_empty());
    }

    #[test]
    fn test_analyses_table_lists_titles() {
        let table = analyses_table(&[
            AnalysisSummary {
                id: "1".into(),
                time: 20,
                title: "later".into(),
            },
            AnalysisSummary {
                id: "0".into(),
                time: 10,
                title: "earlier".into(),
            },
        ]);
        let earlier = table.find("earlier").unwrap();
        let later = table.find("later").unwrap();
        assert!(earlier < later);
    }

    #[test]
    fn test_stats_table_has_all_metrics() {
        let table = stats_table(&StoreStats::default());
        for metric in ["Analyses", "Files", "References"] {
            assert!(table.contains(metric), "{metric}");
        }
    }
}
