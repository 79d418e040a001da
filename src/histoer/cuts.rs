use fnv::FnvHashMap;
use regex::Regex;

use super::histogram1d::{Binning, Histogram};
use super::peak_stats::PeakStats;
use crate::error::{CalError, Result};
use crate::util::statistics;

/// Column store of per-event quantities, all columns the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventTable {
    columns: FnvHashMap<String, Vec<f64>>,
    len: usize,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_column(mut self, name: &str, values: Vec<f64>) -> Result<Self> {
        self.insert_column(name, values)?;
        Ok(self)
    }

    pub fn insert_column(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        if !self.columns.is_empty() && values.len() != self.len {
            return Err(CalError::Contract(format!(
                "column '{name}' has {} rows, table has {}",
                values.len(),
                self.len
            )));
        }
        self.len = values.len();
        self.columns.insert(name.to_string(), values);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Result<&[f64]> {
        self.columns
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| CalError::Contract(format!("no column named '{name}'")))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn column_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.columns.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Rows where `mask` is true.
    pub fn filter(&self, mask: &[bool]) -> Result<EventTable> {
        if mask.len() != self.len {
            return Err(CalError::Contract(format!(
                "mask has {} entries, table has {} rows",
                mask.len(),
                self.len
            )));
        }
        let columns = self
            .columns
            .iter()
            .map(|(name, values)| {
                let kept = values
                    .iter()
                    .zip(mask)
                    .filter_map(|(v, keep)| keep.then_some(*v))
                    .collect();
                (name.clone(), kept)
            })
            .collect();
        Ok(EventTable {
            columns,
            len: mask.iter().filter(|keep| **keep).count(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Operator {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl Operator {
    fn parse(op: &str) -> Option<Self> {
        match op {
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            "==" => Some(Operator::Eq),
            "!=" => Some(Operator::Ne),
            _ => None,
        }
    }

    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Operator::Gt => lhs > rhs,
            Operator::Ge => lhs >= rhs,
            Operator::Lt => lhs < rhs,
            Operator::Le => lhs <= rhs,
            Operator::Eq => lhs == rhs,
            Operator::Ne => lhs != rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ParsedCondition {
    pub column_name: String,
    pub operator: Operator,
    pub literal_value: f64,
}

/// Conjunction of threshold conditions written as text, e.g. `"baseline > 100 & baseline < 200"`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Cut1D {
    pub name: String,
    pub expression: String,
    #[serde(skip)]
    parsed_conditions: Option<Vec<ParsedCondition>>,
}

impl Cut1D {
    pub fn new(name: &str, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            expression: expression.to_string(),
            parsed_conditions: None,
        }
    }

    pub fn parse_conditions(&mut self) -> Result<&[ParsedCondition]> {
        if self.expression.trim().is_empty() {
            return Err(CalError::Contract(format!(
                "empty expression for cut '{}'",
                self.name
            )));
        }

        let condition_re = Regex::new(
            r"^(?P<column>\w+)\s*(?P<op>>=|<=|!=|==|>|<)\s*(?P<value>[-+]?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?|nan|inf|-inf)$",
        )
        .map_err(|e| CalError::Contract(format!("bad condition pattern: {e}")))?;

        let mut conditions = Vec::new();

        // '&' joins conditions
        for expr in self.expression.split('&') {
            let expr = expr.trim();
            let Some(caps) = condition_re.captures(expr) else {
                return Err(CalError::Contract(format!(
                    "failed to parse '{expr}' in cut '{}'",
                    self.name
                )));
            };
            let literal_value: f64 = caps["value"].parse().map_err(|e| {
                CalError::Contract(format!(
                    "invalid numeric literal in cut '{}': {expr} ({e})",
                    self.name
                ))
            })?;
            let operator = Operator::parse(&caps["op"]).ok_or_else(|| {
                CalError::Contract(format!("unknown operator in '{expr}'"))
            })?;
            conditions.push(ParsedCondition {
                column_name: caps["column"].to_string(),
                operator,
                literal_value,
            });
        }

        log::debug!("cut '{}' parsed into {:?}", self.name, conditions);
        let parsed: &[ParsedCondition] = self.parsed_conditions.insert(conditions);
        Ok(parsed)
    }

    pub fn mask(&mut self, table: &EventTable) -> Result<Vec<bool>> {
        if self.parsed_conditions.is_none() {
            self.parse_conditions()?;
        }
        let conditions = self.parsed_conditions.as_deref().unwrap_or_default();

        let mut mask = vec![true; table.len()];
        for condition in conditions {
            let values = table.column(&condition.column_name)?;
            for (keep, value) in mask.iter_mut().zip(values) {
                *keep &= condition.operator.apply(*value, condition.literal_value);
            }
        }
        Ok(mask)
    }
}

/// Keeps events whose `column` lies in `[low, high]`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WindowCut {
    pub name: String,
    pub column: String,
    pub low: f64,
    pub high: f64,
}

impl WindowCut {
    pub fn new(name: &str, column: &str, low: f64, high: f64) -> Result<Self> {
        if !(low <= high) {
            return Err(CalError::Contract(format!(
                "window cut '{name}' has low {low} above high {high}"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            column: column.to_string(),
            low,
            high,
        })
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.low && value <= self.high
    }

    pub fn mask(&self, table: &EventTable) -> Result<Vec<bool>> {
        Ok(table
            .column(&self.column)?
            .iter()
            .map(|v| self.contains(*v))
            .collect())
    }

    /// Window of `n_sigma` estimated peak widths around the dominant peak of `samples`.
    ///
    /// The peak is estimated on the central `[0.5%, 99.5%]` quantile range so a few wild
    /// outliers do not stretch the histogram.
    pub fn around_peak(name: &str, column: &str, samples: &[f64], n_sigma: f64) -> Result<Self> {
        let sorted = statistics::sorted_finite(samples);
        if sorted.len() < 2 {
            return Err(CalError::InsufficientData(format!(
                "window cut '{name}' needs at least two finite samples"
            )));
        }
        let low = statistics::quantile_sorted(&sorted, 0.005);
        let high = statistics::quantile_sorted(&sorted, 0.995);
        if !(high > low) {
            return WindowCut::new(name, column, low, high);
        }
        let hist = Histogram::from_samples(&sorted, (low, high), Binning::Auto)?;
        let stats = PeakStats::estimate(&hist)?;
        if stats.is_degenerate() {
            return Err(CalError::InsufficientData(format!(
                "window cut '{name}' found no usable peak"
            )));
        }
        WindowCut::new(
            name,
            column,
            stats.position - n_sigma * stats.sigma,
            stats.position + n_sigma * stats.sigma,
        )
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Cut {
    Cut1D(Cut1D),
    Window(WindowCut),
}

impl Cut {
    pub fn name(&self) -> &str {
        match self {
            Cut::Cut1D(cut1d) => &cut1d.name,
            Cut::Window(window) => &window.name,
        }
    }

    pub fn mask(&mut self, table: &EventTable) -> Result<Vec<bool>> {
        match self {
            Cut::Cut1D(cut1d) => cut1d.mask(table),
            Cut::Window(window) => window.mask(table),
        }
    }

    pub fn new_1d(name: &str, expression: &str) -> Self {
        Cut::Cut1D(Cut1D::new(name, expression))
    }
}

/// Event selection result with per-cut bookkeeping.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Selection {
    pub mask: Vec<bool>,
    /// Events passing each cut on its own, in cut order.
    pub passed_per_cut: Vec<(String, usize)>,
}

impl Selection {
    pub fn n_passed(&self) -> usize {
        self.mask.iter().filter(|keep| **keep).count()
    }

    pub fn survival_fraction(&self) -> f64 {
        if self.mask.is_empty() {
            f64::NAN
        } else {
            self.n_passed() as f64 / self.mask.len() as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Cuts {
    pub cuts: Vec<Cut>,
}

impl Cuts {
    pub fn new(cuts: Vec<Cut>) -> Self {
        Self { cuts }
    }

    pub fn is_empty(&self) -> bool {
        self.cuts.is_empty()
    }

    pub fn add_cut(&mut self, cut: Cut) -> Result<()> {
        if self.cuts.iter().any(|c| c.name() == cut.name()) {
            return Err(CalError::Contract(format!(
                "cut with name '{}' already exists",
                cut.name()
            )));
        }
        self.cuts.push(cut);
        Ok(())
    }

    /// AND of all cuts. An empty cut list keeps everything.
    pub fn select(&mut self, table: &EventTable) -> Result<Selection> {
        let mut mask = vec![true; table.len()];
        let mut passed_per_cut = Vec::with_capacity(self.cuts.len());
        for cut in &mut self.cuts {
            let cut_mask = cut.mask(table)?;
            passed_per_cut.push((
                cut.name().to_string(),
                cut_mask.iter().filter(|keep| **keep).count(),
            ));
            for (keep, pass) in mask.iter_mut().zip(cut_mask) {
                *keep &= pass;
            }
        }
        let selection = Selection {
            mask,
            passed_per_cut,
        };
        log::info!(
            "quality cuts kept {} of {} events",
            selection.n_passed(),
            table.len()
        );
        Ok(selection)
    }

    pub fn apply(&mut self, table: &EventTable) -> Result<EventTable> {
        let selection = self.select(table)?;
        table.filter(&selection.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn table() -> EventTable {
        EventTable::new()
            .with_column("baseline", vec![50.0, 120.0, 150.0, 250.0, f64::NAN])
            .unwrap()
            .with_column("energy", vec![1.0, 2.0, 3.0, 4.0, 5.0])
            .unwrap()
    }

    #[test]
    fn parses_and_applies_conditions() {
        let mut cut = Cut1D::new("baseline", "baseline > 100 & baseline <= 150");
        let conditions = cut.parse_conditions().unwrap();
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[1].operator, Operator::Le);
        assert_eq!(
            cut.mask(&table()).unwrap(),
            vec![false, true, true, false, false]
        );
    }

    #[test]
    fn rejects_bad_expressions_and_columns() {
        let mut garbled = Cut1D::new("bad", "baseline >> 3");
        assert!(garbled.parse_conditions().unwrap_err().is_contract());

        let mut unknown = Cut1D::new("unknown", "risetime < 3");
        assert!(unknown.mask(&table()).unwrap_err().is_contract());

        let err = EventTable::new()
            .with_column("a", vec![1.0])
            .unwrap()
            .with_column("b", vec![1.0, 2.0])
            .unwrap_err();
        assert!(err.is_contract());
    }

    #[test]
    fn combined_cuts_filter_the_table() {
        let mut cuts = Cuts::default();
        cuts.add_cut(Cut::new_1d("baseline", "baseline > 100")).unwrap();
        cuts.add_cut(Cut::Window(WindowCut::new("energy", "energy", 2.5, 10.0).unwrap()))
            .unwrap();
        assert!(cuts.add_cut(Cut::new_1d("baseline", "energy > 0")).is_err());

        let selection = cuts.select(&table()).unwrap();
        assert_eq!(selection.n_passed(), 2);
        assert_eq!(selection.passed_per_cut[0], ("baseline".to_string(), 3));
        assert_eq!(selection.passed_per_cut[1], ("energy".to_string(), 3));

        let kept = cuts.apply(&table()).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept.column("energy").unwrap(), &[3.0, 4.0]);
    }

    #[test]
    fn sigma_window_brackets_the_peak() {
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(10.0, 0.5).unwrap();
        let samples: Vec<f64> = (0..20_000).map(|_| normal.sample(&mut rng)).collect();
        let window = WindowCut::around_peak("noise", "noise", &samples, 3.0).unwrap();
        assert!((window.low - 8.5).abs() < 0.3, "low {}", window.low);
        assert!((window.high - 11.5).abs() < 0.3, "high {}", window.high);
    }
}
