use serde::{Deserialize, Serialize};

/// A canned, non-generative query for requests mentioning certain words.
///
/// Keywords are whole tokens or token phrases: "month" does not match
/// "3 months". A pattern applies when every `all` keyword is present and, if
/// `any` is non-empty, at least one `any` keyword is present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FallbackPattern {
    pub name: String,
    #[serde(default)]
    pub all: Vec<String>,
    #[serde(default)]
    pub any: Vec<String>,
    pub statement: String,
}

impl FallbackPattern {
    pub fn new(name: &str, all: &[&str], any: &[&str], statement: &str) -> Self {
        Self {
            name: name.into(),
            all: all.iter().map(|s| s.to_string()).collect(),
            any: any.iter().map(|s| s.to_string()).collect(),
            statement: statement.into(),
        }
    }

    /// Number of keywords matched, or `None` if the pattern does not apply.
    fn specificity(&self, tokens: &[String]) -> Option<usize> {
        if self.all.is_empty() && self.any.is_empty() {
            return None;
        }
        if !self.all.iter().all(|k| contains_phrase(tokens, k)) {
            return None;
        }
        let any_hits = self.any.iter().filter(|k| contains_phrase(tokens, k)).count();
        if !self.any.is_empty() && any_hits == 0 {
            return None;
        }
        Some(self.all.len() + any_hits)
    }
}

/// The statement chosen for a request, and which pattern chose it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FallbackChoice<'a> {
    pub name: &'a str,
    pub statement: &'a str,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FallbackCatalog {
    patterns: Vec<FallbackPattern>,
    default_statement: Option<String>,
}

pub const DEFAULT_PATTERN_NAME: &str = "default";

impl FallbackCatalog {
    pub fn new(patterns: Vec<FallbackPattern>, default_statement: Option<String>) -> Self {
        Self {
            patterns,
            default_statement,
        }
    }

    pub fn patterns(&self) -> &[FallbackPattern] {
        &self.patterns
    }

    pub fn default_statement(&self) -> Option<&str> {
        self.default_statement.as_deref()
    }

    /// Picks the pattern matching the most keywords; earlier patterns win ties.
    /// Falls back to the default statement when nothing matches.
    pub fn select(&self, request_text: &str) -> Option<FallbackChoice<'_>> {
        let tokens = tokenize(request_text);
        let mut best: Option<(usize, &FallbackPattern)> = None;
        for pattern in &self.patterns {
            if let Some(score) = pattern.specificity(&tokens) {
                if best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, pattern));
                }
            }
        }
        match best {
            Some((_, p)) => Some(FallbackChoice {
                name: &p.name,
                statement: &p.statement,
            }),
            None => self.default_statement.as_deref().map(|statement| FallbackChoice {
                name: DEFAULT_PATTERN_NAME,
                statement,
            }),
        }
    }

    /// Canned queries over the sales star schema (`fact_sales_forecast`,
    /// `dim_date`, `dim_product`, `dim_store`).
    pub fn sales_star_schema() -> Self {
        let patterns = vec![
            FallbackPattern::new(
                "forecast_first_quarter_by_product",
                &["3 months", "product"],
                &["forecast", "actual"],
                "SELECT p.product_name, SUM(f.forecast_sales) AS forecast_sales \
                 FROM fact_sales_forecast f \
                 JOIN dim_date d ON f.date_id = d.date_id \
                 JOIN dim_product p ON f.product_id = p.product_id \
                 WHERE d.month IN ('January', 'February', 'March') \
                 GROUP BY p.product_name ORDER BY forecast_sales DESC LIMIT 10",
            ),
            FallbackPattern::new(
                "forecast_first_quarter_by_category",
                &["3 months", "category"],
                &["forecast", "actual"],
                "SELECT p.category, SUM(f.forecast_sales) AS forecast_sales \
                 FROM fact_sales_forecast f \
                 JOIN dim_date d ON f.date_id = d.date_id \
                 JOIN dim_product p ON f.product_id = p.product_id \
                 WHERE d.month IN ('January', 'February', 'March') \
                 GROUP BY p.category ORDER BY forecast_sales DESC",
            ),
            FallbackPattern::new(
                "forecast_first_three_months",
                &["3 months"],
                &["forecast", "actual"],
                "SELECT d.month, SUM(f.forecast_sales) AS forecast_sales, SUM(f.actual_sales) AS actual_sales \
                 FROM fact_sales_forecast f \
                 JOIN dim_date d ON f.date_id = d.date_id \
                 GROUP BY d.month ORDER BY MIN(d.date_id) LIMIT 3",
            ),
            FallbackPattern::new(
                "revenue_by_region",
                &["revenue", "region"],
                &[],
                REVENUE_BY_REGION,
            ),
            FallbackPattern::new(
                "revenue_by_category",
                &["revenue", "category"],
                &[],
                "SELECT p.category, SUM(f.revenue) AS total_revenue \
                 FROM fact_sales_forecast f \
                 JOIN dim_product p ON f.product_id = p.product_id \
                 GROUP BY p.category ORDER BY total_revenue DESC",
            ),
            FallbackPattern::new(
                "units_by_category",
                &["category"],
                &[],
                "SELECT p.category, COUNT(*) AS product_count, SUM(f.units_sold) AS units_sold \
                 FROM fact_sales_forecast f \
                 JOIN dim_product p ON f.product_id = p.product_id \
                 GROUP BY p.category ORDER BY units_sold DESC",
            ),
            FallbackPattern::new(
                "revenue_by_product",
                &["product"],
                &["revenue", "sales"],
                "SELECT p.product_name, p.category, SUM(f.revenue) AS total_revenue \
                 FROM fact_sales_forecast f \
                 JOIN dim_product p ON f.product_id = p.product_id \
                 GROUP BY p.product_id, p.product_name, p.category \
                 ORDER BY total_revenue DESC LIMIT 10",
            ),
            FallbackPattern::new(
                "monthly_actual_vs_forecast",
                &["month"],
                &["forecast", "actual", "compare"],
                "SELECT d.month, SUM(f.actual_sales) AS actual, SUM(f.forecast_sales) AS forecast \
                 FROM fact_sales_forecast f \
                 JOIN dim_date d ON f.date_id = d.date_id \
                 GROUP BY d.month ORDER BY MIN(d.date_id)",
            ),
            FallbackPattern::new(
                "quarterly_revenue",
                &["quarter"],
                &[],
                "SELECT d.quarter, SUM(f.revenue) AS total_revenue, SUM(f.units_sold) AS units_sold \
                 FROM fact_sales_forecast f \
                 JOIN dim_date d ON f.date_id = d.date_id \
                 GROUP BY d.quarter ORDER BY d.quarter",
            ),
            FallbackPattern::new(
                "gross_margin",
                &[],
                &["margin", "profit"],
                "SELECT SUM(revenue) AS total_revenue, SUM(cost) AS total_cost, \
                 SUM(revenue) - SUM(cost) AS gross_profit, \
                 ROUND((SUM(revenue) - SUM(cost)) * 100.0 / SUM(revenue), 2) AS gross_margin_pct \
                 FROM fact_sales_forecast",
            ),
            FallbackPattern::new(
                "forecast_by_month",
                &["forecast"],
                &[],
                "SELECT d.month, SUM(f.forecast_sales) AS forecast_sales, SUM(f.actual_sales) AS actual_sales \
                 FROM fact_sales_forecast f \
                 JOIN dim_date d ON f.date_id = d.date_id \
                 GROUP BY d.month ORDER BY MIN(d.date_id)",
            ),
            FallbackPattern::new(
                "revenue_by_store",
                &["store"],
                &[],
                "SELECT s.store_name, s.region, SUM(f.revenue) AS total_revenue \
                 FROM fact_sales_forecast f \
                 JOIN dim_store s ON f.store_id = s.store_id \
                 GROUP BY s.store_id, s.store_name, s.region ORDER BY total_revenue DESC",
            ),
            FallbackPattern::new(
                "totals",
                &[],
                &["revenue", "total"],
                "SELECT SUM(f.revenue) AS total_revenue, SUM(f.units_sold) AS total_units, \
                 SUM(f.revenue) - SUM(f.cost) AS total_profit \
                 FROM fact_sales_forecast f",
            ),
            FallbackPattern::new(
                "monthly_sales",
                &["sales"],
                &[],
                "SELECT d.month, SUM(f.actual_sales) AS actual_sales \
                 FROM fact_sales_forecast f \
                 JOIN dim_date d ON f.date_id = d.date_id \
                 GROUP BY d.month ORDER BY MIN(d.date_id)",
            ),
        ];
        Self::new(patterns, Some(REVENUE_BY_REGION.into()))
    }
}

const REVENUE_BY_REGION: &str = "SELECT s.region, SUM(f.revenue) AS total_revenue \
     FROM fact_sales_forecast f \
     JOIN dim_store s ON f.store_id = s.store_id \
     GROUP BY s.region ORDER BY total_revenue DESC";

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let needle = tokenize(phrase);
    if needle.is_empty() || needle.len() > tokens.len() {
        return false;
    }
    tokens.windows(needle.len()).any(|w| w == needle.as_slice())
}
