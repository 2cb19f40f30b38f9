//! Budget and strategy-paper coverage metrics.
//!
//! Every metric looks forward in year-long windows from "now". Records with a
//! malformed date or amount are skipped individually; none of the metrics
//! mutate anything.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use dq_core::Time;
use dq_storage::CodelistLookup;
use roxmltree::Node;
use tracing::debug;

use crate::document::{child, child_attribute, child_text, children};
use crate::selector::{Selector, SelectorError};

/// Year offsets considered by the budget metrics.
pub const OFFSETS: [u32; 4] = [0, 1, 2, 3];

/// Country budgets are scored against this share of the total budget.
pub const CPA_FACTOR: f64 = 0.2136;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Errors raised while computing a metric.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    /// A built-in selector failed to parse
    #[error(transparent)]
    Selector(#[from] SelectorError),

    /// An amount could not be read
    #[error("{0:?} is not a number")]
    NotANumber(String),

    /// The sector strategy-paper proxy needs at least one sector
    #[error("no sector budget lines to match strategy papers against")]
    NoSectors,
}

/// Parse an amount, tolerating thousands separators and stray ".0" runs.
///
/// The last step removes every ".0" substring, so "1.0.5" reads as 1.5.
pub fn fix_value(text: &str) -> Result<f64, MetricError> {
    let parse = |s: &str| s.trim().parse::<f64>().ok();
    parse(text)
        .or_else(|| parse(&text.replace(',', "")))
        .or_else(|| parse(&text.replace(".0", "")))
        .ok_or_else(|| MetricError::NotANumber(text.to_string()))
}

fn parse_date(text: &str) -> Option<NaiveDateTime> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

/// Forward-looking year window for one offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetWindow {
    /// Year offset, 0 to 3
    pub offset: u32,
    /// Exclusive lower bound
    pub start: NaiveDateTime,
    /// Exclusive upper bound
    pub end: NaiveDateTime,
}

impl BudgetWindow {
    /// Window for `offset` years ahead of `now`.
    pub fn new(now: Time, offset: u32) -> Self {
        let days = 180 + 365 * (i64::from(offset) - 1);
        let start = now.naive_utc() + Duration::days(days);
        Self {
            offset,
            start,
            end: start + Duration::days(365),
        }
    }

    /// Whether a date falls strictly inside the window.
    pub fn contains(&self, date: NaiveDateTime) -> bool {
        date > self.start && date < self.end
    }

    /// Whether an ISO date string falls strictly inside the window. Invalid
    /// dates are never in scope.
    pub fn contains_str(&self, date: &str) -> bool {
        parse_date(date).is_some_and(|date| self.contains(date))
    }
}

/// Total budget found for one offset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct YearBudget {
    /// Whether any total budget ends in the window
    pub available: bool,
    /// Amount of the last such budget
    pub amount: f64,
}

/// Total budgets per offset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FutureBudgets {
    years: [YearBudget; 4],
}

impl FutureBudgets {
    /// Budget for an offset; offsets past 3 are unavailable.
    pub fn year(&self, offset: u32) -> YearBudget {
        self.years.get(offset as usize).copied().unwrap_or_default()
    }

    /// First positive amount scanning offsets 0 to 3.
    pub fn first_positive_amount(&self) -> Option<f64> {
        self.years.iter().map(|y| y.amount).find(|amount| *amount > 0.0)
    }
}

/// Recipient-country budget totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountryBudgets {
    /// Country codes seen in any window; `None` for budgets without a country
    pub countries: BTreeSet<Option<String>>,
    /// Summed country amounts per offset
    pub total_amount: [f64; 4],
    /// CPA-adjusted percentage per offset
    pub total_pct: [f64; 4],
    /// Mean percentage over offsets 1 to 3
    pub score: f64,
}

/// One budget line of a total budget.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetLine {
    /// Line name, taken as the sector name
    pub name: String,
    /// Amount
    pub value: f64,
}

/// Sector budget-line coverage for one offset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectorYear {
    /// Budget lines by `ref`
    pub lines: BTreeMap<String, BudgetLine>,
    /// Amount of the last in-scope total budget
    pub budget_total: f64,
    /// Budget-line amounts accumulated over in-scope budgets
    pub lines_total: f64,
    /// Lines as a percentage of the total, capped at 100
    pub lines_pct: f64,
}

/// Computes coverage metrics relative to a fixed "now".
#[derive(Clone)]
pub struct InfoMetricsEngine {
    now: Time,
    codelist: Option<Arc<dyn CodelistLookup>>,
}

impl std::fmt::Debug for InfoMetricsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfoMetricsEngine")
            .field("now", &self.now)
            .field("codelist", &self.codelist.is_some())
            .finish()
    }
}

impl InfoMetricsEngine {
    /// Create an engine evaluating windows from `now`.
    pub fn new(now: Time) -> Self {
        Self { now, codelist: None }
    }

    /// Name countries that lack one in the document through this codelist.
    pub fn with_codelist(mut self, codelist: Arc<dyn CodelistLookup>) -> Self {
        self.codelist = Some(codelist);
        self
    }

    /// The reference time.
    pub fn now(&self) -> Time {
        self.now
    }

    /// Window for an offset.
    pub fn window(&self, offset: u32) -> BudgetWindow {
        BudgetWindow::new(self.now, offset)
    }

    fn later_than_now(&self, date: &str) -> bool {
        parse_date(date).is_some_and(|date| date > self.now.naive_utc())
    }

    /// Total budgets available in each of the offsets 0 to 3.
    pub fn total_future_budgets(&self, node: Node<'_, '_>) -> Result<FutureBudgets, MetricError> {
        let budgets = Selector::parse("//total-budget[period-end/@iso-date]")?.select_nodes(node);
        let mut out = FutureBudgets::default();

        for offset in OFFSETS {
            let window = self.window(offset);
            for budget in &budgets {
                let Some(end) = child(*budget, "period-end").and_then(|e| e.attribute("iso-date")) else {
                    continue;
                };
                // a record without a period start is malformed
                if child_attribute(*budget, "period-start", "iso-date").is_none() || !window.contains_str(end) {
                    continue;
                }
                let Some(Ok(amount)) = child_text(*budget, "value").map(fix_value) else {
                    debug!("Skipping total budget ending {} with no usable value", end);
                    continue;
                };
                out.years[offset as usize] = YearBudget { available: true, amount };
            }
        }

        Ok(out)
    }

    /// Recipient-country budgets as a CPA-adjusted share of total budgets.
    pub fn total_country_budgets(
        &self,
        node: Node<'_, '_>,
        totals: &FutureBudgets,
    ) -> Result<CountryBudgets, MetricError> {
        let budgets = Selector::parse("//recipient-country-budget[period-end/@iso-date]")?.select_nodes(node);
        let mut out = CountryBudgets::default();

        for offset in OFFSETS {
            let window = self.window(offset);
            for budget in &budgets {
                let in_scope = child_attribute(*budget, "period-end", "iso-date")
                    .is_some_and(|end| window.contains_str(end));
                if !in_scope {
                    continue;
                }
                let Some(Ok(amount)) = child_text(*budget, "value").map(fix_value) else {
                    continue;
                };
                let code = child_attribute(*budget, "recipient-country", "code").map(str::to_string);
                out.countries.insert(code);
                out.total_amount[offset as usize] += amount;
            }
        }

        let cpa_percentage = |countries: f64, total: f64| {
            let adjusted = total * CPA_FACTOR;
            (adjusted != 0.0).then(|| (countries / adjusted * 100.0).min(100.0))
        };
        for offset in OFFSETS {
            let i = offset as usize;
            let countries = out.total_amount[i];
            out.total_pct[i] = cpa_percentage(countries, totals.year(offset).amount)
                .or_else(|| cpa_percentage(countries, totals.first_positive_amount()?))
                .unwrap_or(0.0);
        }
        out.score = out.total_pct[1..].iter().sum::<f64>() / 3.0;

        Ok(out)
    }

    /// Country budget score, or the sector budget proxy when it is not positive.
    pub fn total_country_budgets_single_result(&self, node: Node<'_, '_>) -> Result<f64, MetricError> {
        let totals = self.total_future_budgets(node)?;
        let score = self.total_country_budgets(node, &totals)?.score;
        if score > 0.0 {
            return Ok(score);
        }
        debug!("Country budget score {} not positive; using sector budgets", score);
        self.total_sector_budgets_single_result(node)
    }

    /// Countries with an active, positive budget, mapped to their names.
    pub fn active_countries(&self, node: Node<'_, '_>) -> Result<BTreeMap<Option<String>, Option<String>>, MetricError> {
        let budgets = Selector::parse("//recipient-country-budget[period-end/@iso-date]")?.select_nodes(node);
        let mut countries = BTreeMap::new();

        for budget in budgets {
            let active = child_attribute(budget, "period-end", "iso-date").is_some_and(|end| self.later_than_now(end));
            let has_value = child_text(budget, "value")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .is_some_and(|v| v.trunc() > 0.0);
            if !(active && has_value) {
                continue;
            }
            let (code, name) = match child(budget, "recipient-country") {
                Some(country) => {
                    let name = match child(country, "narrative") {
                        Some(narrative) => narrative.text(),
                        None => country.text(),
                    };
                    (country.attribute("code").map(str::to_string), name.map(str::to_string))
                }
                None => (None, None),
            };
            countries.insert(code, name);
        }

        Ok(countries)
    }

    fn country_name(&self, code: Option<&str>, name: Option<&str>) -> Option<String> {
        match name.filter(|n| !n.trim().is_empty()) {
            Some(name) => Some(name.to_string()),
            None => self.codelist.as_ref()?.name_for(code?),
        }
    }

    /// Share of active countries covered by a country strategy paper.
    pub fn country_strategy_papers(&self, node: Node<'_, '_>) -> Result<f64, MetricError> {
        let countries = self.active_countries(node)?;
        if countries.is_empty() {
            debug!("No active countries; using sector strategy papers");
            return self.total_sector_strategy_papers(node);
        }

        let papers = Selector::parse("//document-link[category/@code='B03']")?.select_nodes(node);
        let total = countries.len();
        let mut unmatched = 0usize;

        for (code, name) in &countries {
            let name = self.country_name(code.as_deref(), name.as_deref()).map(|n| n.to_lowercase());
            let covered = papers.iter().any(|paper| {
                let by_code = match (child_attribute(*paper, "recipient-country", "code"), code) {
                    (Some(paper_code), Some(code)) => paper_code.eq_ignore_ascii_case(code),
                    _ => false,
                };
                let by_title = match (&name, paper_title(*paper)) {
                    (Some(name), Some(title)) => title.to_lowercase().contains(name.as_str()),
                    _ => false,
                };
                by_code || by_title
            });
            if !covered {
                debug!("No strategy paper for country {:?}", code);
                unmatched += 1;
            }
        }

        let score = 100.0 - (unmatched as f64 / total as f64) * 100.0;
        if score > 0.0 {
            return Ok(score);
        }
        self.total_sector_strategy_papers(node)
    }

    /// Percentage of offsets 1 to 3 with an available total budget.
    pub fn total_budgets_available(&self, node: Node<'_, '_>) -> Result<f64, MetricError> {
        let budgets = self.total_future_budgets(node)?;
        let available = (1..=3).filter(|offset| budgets.year(*offset).available).count();
        Ok(available as f64 / 3.0 * 100.0)
    }

    /// Budget-line coverage of total budgets for each of the offsets 0 to 3.
    pub fn total_sector_budgets(&self, node: Node<'_, '_>) -> Result<[SectorYear; 4], MetricError> {
        let budgets = Selector::parse("//total-budget")?.select_nodes(node);
        let mut out: [SectorYear; 4] = Default::default();

        for offset in OFFSETS {
            let window = self.window(offset);
            let year = &mut out[offset as usize];
            for budget in &budgets {
                let in_scope = child_attribute(*budget, "period-end", "iso-date")
                    .is_some_and(|end| window.contains_str(end));
                if !in_scope {
                    continue;
                }
                let Some(total) = child_text(*budget, "value").and_then(|v| v.trim().parse::<f64>().ok()) else {
                    continue;
                };
                year.budget_total = total;
                for line in children(*budget, "budget-line") {
                    let name = child_text(line, "narrative");
                    let value = child_text(line, "value").and_then(|v| v.trim().parse::<f64>().ok());
                    let (Some(name), Some(value)) = (name, value) else {
                        continue;
                    };
                    let reference = line.attribute("ref").unwrap_or_default().to_string();
                    year.lines.insert(reference, BudgetLine { name: name.to_string(), value });
                    year.lines_total += value;
                }
                year.lines_pct = if year.budget_total == 0.0 {
                    0.0
                } else {
                    (year.lines_total / year.budget_total * 100.0).min(100.0)
                };
            }
        }

        Ok(out)
    }

    /// Mean budget-line coverage over offsets 0 to 3.
    pub fn total_sector_budgets_single_result(&self, node: Node<'_, '_>) -> Result<f64, MetricError> {
        let years = self.total_sector_budgets(node)?;
        Ok(years.iter().map(|y| y.lines_pct).sum::<f64>() / years.len() as f64)
    }

    /// Share of budget-line sectors named in a sector strategy paper title.
    pub fn total_sector_strategy_papers(&self, node: Node<'_, '_>) -> Result<f64, MetricError> {
        let sectors: BTreeSet<String> = self
            .total_sector_budgets(node)?
            .into_iter()
            .flat_map(|year| year.lines.into_values().map(|line| line.name))
            .collect();
        if sectors.is_empty() {
            return Err(MetricError::NoSectors);
        }

        let titles = Selector::parse(
            "//document-link[category/@code='B11']/title/narrative/text()\
             |document-link[category/@code='B12']/title/narrative/text()",
        )?
        .select_strings(node);
        let found = sectors
            .iter()
            .filter(|sector| titles.iter().any(|title| title.contains(sector.as_str())))
            .count();

        Ok(found as f64 / sectors.len() as f64 * 100.0)
    }
}

/// Title text of a document link, falling back to its narrative when blank.
fn paper_title<'a>(paper: Node<'a, '_>) -> Option<&'a str> {
    let title = child(paper, "title")?;
    match title.text().filter(|t| !t.trim().is_empty()) {
        Some(text) => Some(text),
        None => child_text(title, "narrative"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_document;
    use chrono::{TimeZone, Utc};
    use dq_storage::StaticCodelist;

    // Windows from this date:
    // 0: 2023-06-30..2024-06-29, 1: ..2025-06-29, 2: ..2026-06-29, 3: ..2027-06-29
    fn engine() -> InfoMetricsEngine {
        InfoMetricsEngine::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    fn total_budget(end: &str, value: &str) -> String {
        format!(
            r#"<total-budget><period-start iso-date="2020-01-01"/><period-end iso-date="{end}"/><value>{value}</value></total-budget>"#
        )
    }

    fn country_budget(code: &str, name: &str, end: &str, value: &str) -> String {
        format!(
            r#"<recipient-country-budget><recipient-country code="{code}">{name}</recipient-country><period-end iso-date="{end}"/><value>{value}</value></recipient-country-budget>"#
        )
    }

    fn org(body: &str) -> String {
        format!("<iati-organisations><iati-organisation>{body}</iati-organisation></iati-organisations>")
    }

    #[test]
    fn test_fix_value() {
        assert_eq!(fix_value("12.5").unwrap(), 12.5);
        assert_eq!(fix_value(" 300 ").unwrap(), 300.0);
        assert_eq!(fix_value("1,234.00").unwrap(), 1234.0);
        assert_eq!(fix_value("1.05").unwrap(), 1.05);
        // the last fallback drops every ".0"
        assert_eq!(fix_value("1.0.5").unwrap(), 1.5);
        assert!(matches!(fix_value("n/a"), Err(MetricError::NotANumber(_))));
    }

    #[test]
    fn test_window_bounds_are_exclusive() {
        let window = engine().window(1);
        assert_eq!(window.start.date(), NaiveDate::from_ymd_opt(2024, 6, 29).unwrap());
        assert_eq!(window.end.date(), NaiveDate::from_ymd_opt(2025, 6, 29).unwrap());
        assert!(!window.contains_str("2024-06-29"));
        assert!(window.contains_str("2024-06-30"));
        assert!(!window.contains_str("2025-06-29"));
        assert!(!window.contains_str("not a date"));
        assert!(engine().window(0).contains_str("2024-03-31"));
    }

    #[test]
    fn test_budget_ending_200_days_out_is_offset_one() {
        let e = engine();
        let end = (e.now() + Duration::days(200)).format(DATE_FORMAT).to_string();
        let xml = org(&total_budget(&end, "1,234.00"));
        let doc = parse_document(&xml).unwrap();

        let budgets = e.total_future_budgets(doc.root_element()).unwrap();
        assert_eq!(budgets.year(1), YearBudget { available: true, amount: 1234.0 });
        assert!(!budgets.year(0).available);
        assert!(!budgets.year(2).available);
    }

    #[test]
    fn test_total_future_budgets_skips_malformed_records() {
        let body = [
            total_budget("2025-12-31", "abc"),
            r#"<total-budget><period-end iso-date="2024-03-31"/><value>5</value></total-budget>"#.to_string(),
            total_budget("2026-12-31", "10"),
            total_budget("2026-10-31", "20"),
        ]
        .concat();
        let xml = org(&body);
        let doc = parse_document(&xml).unwrap();

        let budgets = engine().total_future_budgets(doc.root_element()).unwrap();
        assert!(!budgets.year(0).available);
        assert!(!budgets.year(2).available);
        // last matching record wins
        assert_eq!(budgets.year(3).amount, 20.0);
        assert_eq!(budgets.first_positive_amount(), Some(20.0));
    }

    #[test]
    fn test_total_country_budgets() {
        let body = [
            total_budget("2024-12-31", "1000000"),
            country_budget("KE", "Kenya", "2024-12-31", "106800"),
            country_budget("KE", "Kenya", "2025-12-31", "213600"),
        ]
        .concat();
        let xml = org(&body);
        let doc = parse_document(&xml).unwrap();
        let e = engine();
        let totals = e.total_future_budgets(doc.root_element()).unwrap();

        let countries = e.total_country_budgets(doc.root_element(), &totals).unwrap();
        assert_eq!(countries.countries.len(), 1);
        assert!((countries.total_pct[1] - 50.0).abs() < 1e-9);
        // no total for offset 2, so the first positive total is used
        assert!((countries.total_pct[2] - 100.0).abs() < 1e-9);
        assert_eq!(countries.total_pct[3], 0.0);
        assert!((countries.score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_total_country_budgets_without_totals_is_zero() {
        let xml = org(&country_budget("KE", "Kenya", "2024-12-31", "100"));
        let doc = parse_document(&xml).unwrap();
        let e = engine();
        let countries = e
            .total_country_budgets(doc.root_element(), &FutureBudgets::default())
            .unwrap();
        assert_eq!(countries.total_pct, [0.0; 4]);
        assert_eq!(countries.score, 0.0);
    }

    #[test]
    fn test_country_percentage_is_capped() {
        let body = [
            total_budget("2024-12-31", "100"),
            country_budget("KE", "Kenya", "2024-12-31", "1000"),
        ]
        .concat();
        let xml = org(&body);
        let doc = parse_document(&xml).unwrap();
        let e = engine();
        let totals = e.total_future_budgets(doc.root_element()).unwrap();
        let countries = e.total_country_budgets(doc.root_element(), &totals).unwrap();
        assert_eq!(countries.total_pct[1], 100.0);
    }

    #[test]
    fn test_country_strategy_papers() {
        let body = [
            country_budget("KE", "Kenya", "2025-12-31", "100"),
            country_budget("UG", "", "2025-12-31", "100"),
            country_budget("RW", "Rwanda", "2025-12-31", "100"),
            country_budget("TZ", "Tanzania", "2025-12-31", "0.5"),
            country_budget("ET", "Ethiopia", "2020-12-31", "100"),
            r#"<document-link><category code="B03"/><recipient-country code="ke"/><title>Plan</title></document-link>"#.to_string(),
            r#"<document-link><category code="B03"/><title><narrative>UGANDA strategy 2024</narrative></title></document-link>"#.to_string(),
            r#"<document-link><category code="A01"/><title>Rwanda</title></document-link>"#.to_string(),
        ]
        .concat();
        let xml = org(&body);
        let doc = parse_document(&xml).unwrap();
        let codelist = Arc::new(StaticCodelist::from_pairs([("UG", "Uganda")]));
        let e = engine().with_codelist(codelist);

        let countries = e.active_countries(doc.root_element()).unwrap();
        assert_eq!(countries.len(), 3);

        let score = e.country_strategy_papers(doc.root_element()).unwrap();
        assert!((score - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_country_strategy_papers_fall_back_to_sectors() {
        let body = r#"<total-budget><period-end iso-date="2024-12-31"/><value>1000</value>
                <budget-line ref="1"><value>400</value><narrative>Health</narrative></budget-line>
                <budget-line ref="2"><value>100</value><narrative>Education</narrative></budget-line>
            </total-budget>
            <document-link><category code="B11"/><title><narrative>Health sector strategy</narrative></title></document-link>"#;
        let xml = org(body);
        let doc = parse_document(&xml).unwrap();
        let e = engine();

        let years = e.total_sector_budgets(doc.root_element()).unwrap();
        assert_eq!(years[1].lines.len(), 2);
        assert_eq!(years[1].lines_total, 500.0);
        assert_eq!(years[1].lines_pct, 50.0);
        assert_eq!(e.total_sector_budgets_single_result(doc.root_element()).unwrap(), 12.5);

        assert_eq!(e.total_sector_strategy_papers(doc.root_element()).unwrap(), 50.0);
        assert_eq!(e.country_strategy_papers(doc.root_element()).unwrap(), 50.0);
    }

    #[test]
    fn test_sector_strategy_papers_without_sectors_is_error() {
        let xml = org("");
        let doc = parse_document(&xml).unwrap();
        assert_eq!(
            engine().total_sector_strategy_papers(doc.root_element()),
            Err(MetricError::NoSectors)
        );
        assert!(engine().country_strategy_papers(doc.root_element()).is_err());
    }

    #[test]
    fn test_country_budgets_single_result_uses_sector_proxy() {
        let body = r#"<total-budget><period-end iso-date="2024-12-31"/><value>1000</value>
                <budget-line ref="1"><value>2000</value><narrative>Health</narrative></budget-line>
            </total-budget>"#;
        let xml = org(body);
        let doc = parse_document(&xml).unwrap();
        // no period-start, so no total budgets and no country score
        assert_eq!(engine().total_country_budgets_single_result(doc.root_element()).unwrap(), 25.0);
    }

    #[test]
    fn test_total_budgets_available() {
        let body = [
            total_budget("2024-03-31", "1"),
            total_budget("2024-12-31", "1"),
            total_budget("2026-12-31", "1"),
        ]
        .concat();
        let xml = org(&body);
        let doc = parse_document(&xml).unwrap();
        let value = engine().total_budgets_available(doc.root_element()).unwrap();
        assert!((value - 200.0 / 3.0).abs() < 1e-9);
    }
}
