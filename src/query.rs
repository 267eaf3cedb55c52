use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use crate::error::Result;
use crate::parser::{SOURCE_COLUMN, Scalar};
use crate::store::{SessionReference, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

/// One plotted line: the selected columns of one source file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub name: String,
    pub x: Vec<Scalar>,
    pub y: Vec<Scalar>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Figure {
    pub x_label: String,
    pub y_label: String,
    pub series: Vec<Series>,
}

/// Result of a plot request.
///
/// `Prompt` asks the user for more input, `Alert` reports a selected column
/// that the dataset does not have.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlotOutcome {
    Prompt { message: String },
    Alert { axis: Axis, message: String },
    Figure(Figure),
}

impl PlotOutcome {
    fn prompt(message: &str) -> Self {
        PlotOutcome::Prompt {
            message: message.to_string(),
        }
    }

    fn missing(axis: Axis) -> Self {
        let message = match axis {
            Axis::X => "x axis not in columns",
            Axis::Y => "y axis not in columns",
        };
        PlotOutcome::Alert {
            axis,
            message: message.to_string(),
        }
    }
}

/// Re-read the session table and build one series per source file holding
/// the last `tail_rows` rows of the selected columns.
///
/// The table is only read.
///
/// # Arguments
/// * `store` - Store holding the session tables
/// * `session` - Table produced by the last processing request, if any
/// * `x` - Selected x column
/// * `y` - Selected y column
/// * `tail_rows` - Rows kept per source file, most recent last
///
/// # Returns
/// * `Result<PlotOutcome>` - A prompt while input is missing, an alert for a
///   column the table does not have, otherwise the figure
pub fn plot(
    store: &SessionStore,
    session: Option<&SessionReference>,
    x: Option<&str>,
    y: Option<&str>,
    tail_rows: usize,
) -> Result<PlotOutcome> {
    let Some(session) = session else {
        return Ok(PlotOutcome::prompt("Upload & Process Data"));
    };
    let Some(x) = x else {
        return Ok(PlotOutcome::prompt("Select x axis data"));
    };
    let Some(y) = y else {
        return Ok(PlotOutcome::prompt("Select y axis data"));
    };

    let columns = store.columns(session)?;
    if !columns.iter().any(|c| c == x) {
        return Ok(PlotOutcome::missing(Axis::X));
    }
    if !columns.iter().any(|c| c == y) {
        return Ok(PlotOutcome::missing(Axis::Y));
    }

    let rows = store.load_columns(session, &[SOURCE_COLUMN, x, y])?;
    Ok(PlotOutcome::Figure(build_figure(rows, x, y, tail_rows)))
}

/// Group `[source, x, y]` rows by source and keep the last `tail_rows` of each.
/// Groups come out ordered by name.
pub fn build_figure(
    rows: impl IntoIterator<Item = Vec<Scalar>>,
    x: &str,
    y: &str,
    tail_rows: usize,
) -> Figure {
    let mut groups: BTreeMap<String, VecDeque<(Scalar, Scalar)>> = BTreeMap::new();

    for row in rows {
        let mut cells = row.into_iter();
        let (Some(source), Some(xv), Some(yv)) = (cells.next(), cells.next(), cells.next()) else {
            continue;
        };
        let key = match source {
            Scalar::Text(s) => s,
            Scalar::Null => continue,
            other => serde_json::to_string(&other).unwrap_or_default(),
        };
        let group = groups.entry(key).or_default();
        group.push_back((xv, yv));
        if group.len() > tail_rows {
            group.pop_front();
        }
    }

    let series = groups
        .into_iter()
        .map(|(name, points)| {
            let (x, y) = points.into_iter().unzip();
            Series { name, x, y }
        })
        .collect();

    Figure {
        x_label: x.to_string(),
        y_label: y.to_string(),
        series,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Dataset;

    fn rows(source: &str, n: usize) -> impl Iterator<Item = Vec<Scalar>> + '_ {
        (0..n).map(move |i| {
            vec![
                Scalar::Text(source.to_string()),
                Scalar::Int(i as i64),
                Scalar::Float(i as f64 * 0.5),
            ]
        })
    }

    #[test]
    fn large_group_is_truncated_to_most_recent_rows() {
        let figure = build_figure(rows("big", 250_000).chain(rows("small", 500)), "x", "y", 200_000);

        assert_eq!(figure.series.len(), 2);
        let big = &figure.series[0];
        assert_eq!(big.name, "big");
        assert_eq!(big.x.len(), 200_000);
        assert_eq!(big.x.first(), Some(&Scalar::Int(50_000)));
        assert_eq!(big.x.last(), Some(&Scalar::Int(249_999)));

        let small = &figure.series[1];
        assert_eq!(small.name, "small");
        assert_eq!(small.x.len(), 500);
        assert_eq!(small.y.len(), 500);
    }

    #[test]
    fn interleaved_groups_keep_their_own_order() {
        let data = vec![
            vec![Scalar::Text("b".into()), Scalar::Int(1), Scalar::Int(10)],
            vec![Scalar::Text("a".into()), Scalar::Int(2), Scalar::Int(20)],
            vec![Scalar::Text("b".into()), Scalar::Int(3), Scalar::Int(30)],
        ];
        let figure = build_figure(data, "x", "y", 1);
        assert_eq!(figure.series[0].name, "a");
        assert_eq!(figure.series[1].name, "b");
        assert_eq!(figure.series[1].x, vec![Scalar::Int(3)]);
        assert_eq!(figure.series[1].y, vec![Scalar::Int(30)]);
    }

    fn stored(dir: &std::path::Path) -> (SessionStore, SessionReference) {
        let store = SessionStore::new(dir);
        let dataset = Dataset {
            columns: vec![SOURCE_COLUMN.into(), "omega".into(), "y1".into()],
            rows: rows("f", 3).collect(),
        };
        let reference = store.create(&dataset).unwrap();
        (store, reference)
    }

    #[test]
    fn missing_inputs_are_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let (store, reference) = stored(dir.path());

        assert_eq!(
            plot(&store, None, Some("omega"), Some("y1"), 10).unwrap(),
            PlotOutcome::prompt("Upload & Process Data")
        );
        assert_eq!(
            plot(&store, Some(&reference), None, Some("y1"), 10).unwrap(),
            PlotOutcome::prompt("Select x axis data")
        );
        assert_eq!(
            plot(&store, Some(&reference), Some("omega"), None, 10).unwrap(),
            PlotOutcome::prompt("Select y axis data")
        );
    }

    #[test]
    fn absent_columns_are_distinct_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let (store, reference) = stored(dir.path());

        assert_eq!(
            plot(&store, Some(&reference), Some("nope"), Some("y1"), 10).unwrap(),
            PlotOutcome::missing(Axis::X)
        );
        assert_eq!(
            plot(&store, Some(&reference), Some("omega"), Some("nope"), 10).unwrap(),
            PlotOutcome::missing(Axis::Y)
        );
    }

    #[test]
    fn plotting_reads_but_never_changes_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let (store, reference) = stored(dir.path());
        let before = store.load(&reference).unwrap();

        let outcome = plot(&store, Some(&reference), Some("omega"), Some("y1"), 2).unwrap();
        let PlotOutcome::Figure(figure) = outcome else {
            panic!("expected a figure");
        };
        assert_eq!(figure.series.len(), 1);
        assert_eq!(figure.series[0].x, vec![Scalar::Int(1), Scalar::Int(2)]);
        assert_eq!(store.load(&reference).unwrap(), before);
    }

    #[test]
    fn outcomes_serialize_with_a_kind_tag() {
        let json = serde_json::to_value(PlotOutcome::missing(Axis::Y)).unwrap();
        assert_eq!(json["kind"], "alert");
        assert_eq!(json["axis"], "y");
    }
}
