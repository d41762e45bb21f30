//! Volatility Charts
//! Mission: Render the three-panel PNG sent with the morning report
//!
//! Panels: close price with the three buy targets, daily returns with ±1σ/±2σ
//! bands, and the return histogram with a fitted normal curve.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use plotters::prelude::*;
use plotters::style::FontStyle;
use statrs::distribution::{Continuous, Normal};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::analysis::volatility::VolatilityReport;
use crate::models::{AlertLevel, DailyBar};

const WIDTH: u32 = 1400;
const HEIGHT: u32 = 1500;
const HISTOGRAM_BINS: usize = 40;

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/nanum/NanumGothic.ttf",
    "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/Library/Fonts/Arial Unicode.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\malgun.ttf",
];

fn plot_err<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow!("chart drawing failed: {}", e)
}

/// A font file usable for chart text. Discovered once by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct FontConfig {
    pub family: String,
    pub path: PathBuf,
}

impl FontConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        path.is_file().then(|| Self {
            family: "sans-serif".to_string(),
            path: path.to_path_buf(),
        })
    }

    /// The configured font if it exists, else the first known system font.
    pub fn discover(configured: Option<&str>) -> Option<Self> {
        if let Some(p) = configured {
            match Self::from_path(p) {
                Some(font) => return Some(font),
                None => warn!("⚠️  Chart font {} not found, searching system fonts", p),
            }
        }
        FONT_CANDIDATES.iter().find_map(Self::from_path)
    }
}

/// File-system safe version of a display name.
pub fn safe_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    let collapsed = cleaned
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    collapsed.chars().take(40).collect()
}

#[derive(Debug, Clone)]
pub struct ChartRenderer {
    out_dir: PathBuf,
    family: String,
}

impl ChartRenderer {
    /// Fails when no font is available; callers then send text only.
    pub fn new(out_dir: impl Into<PathBuf>, font: Option<FontConfig>) -> Result<Self> {
        let font = font.ok_or_else(|| anyhow!("No chart font available"))?;
        let bytes = std::fs::read(&font.path)
            .with_context(|| format!("Failed to read font {}", font.path.display()))?;
        // plotters keeps registered fonts for the life of the process.
        let bytes: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        plotters::style::register_font(&font.family, FontStyle::Normal, bytes)
            .map_err(|_| anyhow!("Invalid font {}", font.path.display()))?;

        info!("🖼️  Charts use font {}", font.path.display());
        Ok(Self {
            out_dir: out_dir.into(),
            family: font.family,
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn chart_path(&self, ticker: &str, name: &str, date: NaiveDate) -> PathBuf {
        self.out_dir.join(ticker).join(format!(
            "{}_{}_{}_volatility.png",
            date.format("%Y%m%d"),
            ticker,
            safe_name(name)
        ))
    }

    /// Render (or reuse) today's chart for a ticker.
    pub fn render(
        &self,
        ticker: &str,
        name: &str,
        bars: &[DailyBar],
        report: &VolatilityReport,
        date: NaiveDate,
    ) -> Result<PathBuf> {
        let path = self.chart_path(ticker, name, date);
        if path.is_file() {
            debug!(ticker, path = %path.display(), "Reusing chart");
            return Ok(path);
        }
        if bars.len() < 2 {
            return Err(anyhow!("Not enough bars to chart {}", ticker));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        self.draw(&path, ticker, name, bars, report)?;
        info!(ticker, path = %path.display(), "📈 Chart rendered");
        Ok(path)
    }

    /// [`ChartRenderer::render`] on the blocking pool.
    pub async fn render_blocking(
        &self,
        ticker: String,
        name: String,
        bars: Vec<DailyBar>,
        report: VolatilityReport,
        date: NaiveDate,
    ) -> Result<PathBuf> {
        let renderer = self.clone();
        tokio::task::spawn_blocking(move || renderer.render(&ticker, &name, &bars, &report, date))
            .await
            .context("Chart task panicked")?
    }

    fn draw(
        &self,
        path: &Path,
        ticker: &str,
        name: &str,
        bars: &[DailyBar],
        report: &VolatilityReport,
    ) -> Result<()> {
        let family = self.family.as_str();
        let root = BitMapBackend::new(path, (WIDTH, HEIGHT)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let root = root
            .titled(
                &format!("{} ({}) volatility analysis", name, ticker),
                (family, 30),
            )
            .map_err(plot_err)?;
        let panels = root.split_evenly((3, 1));

        let dates: Vec<NaiveDate> = bars.iter().map(|b| b.date).collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let t = &report.targets;
        let levels = [
            (AlertLevel::Half, RGBColor(255, 165, 0)),
            (AlertLevel::One, RGBColor(220, 20, 60)),
            (AlertLevel::Two, RGBColor(128, 0, 128)),
        ];
        let date_label = |i: &usize| {
            dates
                .get(*i)
                .map(|d| d.format("%y-%m-%d").to_string())
                .unwrap_or_default()
        };

        // Price with target lines.
        {
            let n = closes.len();
            let lo = closes
                .iter()
                .copied()
                .chain(levels.iter().map(|(l, _)| t.target(*l)))
                .fold(f64::INFINITY, f64::min);
            let hi = closes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let pad = ((hi - lo) * 0.05).max(hi.abs() * 0.001).max(1e-6);

            let mut chart = ChartBuilder::on(&panels[0])
                .caption("Close and buy targets", (family, 20))
                .margin(12)
                .x_label_area_size(30)
                .y_label_area_size(70)
                .build_cartesian_2d(0usize..n, (lo - pad)..(hi + pad))
                .map_err(plot_err)?;
            chart
                .configure_mesh()
                .x_labels(8)
                .x_label_formatter(&date_label)
                .y_label_formatter(&|v| format!("{:.2}", v))
                .label_style((family, 14))
                .draw()
                .map_err(plot_err)?;

            chart
                .draw_series(LineSeries::new(
                    closes.iter().enumerate().map(|(i, c)| (i, *c)),
                    BLUE.stroke_width(2),
                ))
                .map_err(plot_err)?
                .label("Close")
                .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE.stroke_width(2)));

            for (level, color) in levels {
                let price = t.target(level);
                chart
                    .draw_series(LineSeries::new(
                        vec![(0, price), (n - 1, price)],
                        color.stroke_width(2),
                    ))
                    .map_err(plot_err)?
                    .label(format!("{} {:.2} (-{:.2}%)", level.title(), price, t.drop_pct(level)))
                    .legend(move |(x, y)| {
                        PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
                    });
            }
            chart
                .configure_series_labels()
                .label_font((family, 14))
                .background_style(WHITE.mix(0.85))
                .border_style(BLACK)
                .position(SeriesLabelPosition::LowerLeft)
                .draw()
                .map_err(plot_err)?;
        }

        // Daily returns with sigma bands; return i belongs to date i + 1.
        {
            let returns = &report.returns;
            let n = returns.len() + 1;
            let sd = t.std_return;
            let extent = returns
                .iter()
                .map(|r| r.abs())
                .fold(2.0 * sd, f64::max)
                .max(0.5)
                * 1.1;

            let mut chart = ChartBuilder::on(&panels[1])
                .caption("Daily returns (%)", (family, 20))
                .margin(12)
                .x_label_area_size(30)
                .y_label_area_size(70)
                .build_cartesian_2d(0usize..n, -extent..extent)
                .map_err(plot_err)?;
            chart
                .configure_mesh()
                .x_labels(8)
                .x_label_formatter(&date_label)
                .y_label_formatter(&|v| format!("{:.1}", v))
                .label_style((family, 14))
                .draw()
                .map_err(plot_err)?;

            chart
                .draw_series(returns.iter().enumerate().map(|(i, r)| {
                    let color = if *r >= 0.0 { GREEN.mix(0.7) } else { RED.mix(0.7) };
                    Rectangle::new([(i + 1, 0.0), (i + 2, *r)], color.filled())
                }))
                .map_err(plot_err)?;

            for (mult, color) in [(1.0, RGBColor(220, 20, 60)), (2.0, RGBColor(128, 0, 128))] {
                for sign in [1.0, -1.0] {
                    let y = sign * mult * sd;
                    chart
                        .draw_series(LineSeries::new(vec![(0, y), (n - 1, y)], color.stroke_width(1)))
                        .map_err(plot_err)?;
                }
            }
        }

        // Histogram with fitted normal curve.
        {
            let returns = &report.returns;
            let lo = returns.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = returns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let (lo, hi) = if hi - lo < 1e-9 { (lo - 1.0, hi + 1.0) } else { (lo, hi) };
            let width = (hi - lo) / HISTOGRAM_BINS as f64;

            let mut counts = vec![0usize; HISTOGRAM_BINS];
            for r in returns {
                let idx = (((r - lo) / width) as usize).min(HISTOGRAM_BINS - 1);
                counts[idx] += 1;
            }
            let max_count = counts.iter().copied().max().unwrap_or(1).max(1) as f64;

            let mut chart = ChartBuilder::on(&panels[2])
                .caption("Return distribution", (family, 20))
                .margin(12)
                .x_label_area_size(30)
                .y_label_area_size(70)
                .build_cartesian_2d(lo..hi, 0.0..max_count * 1.15)
                .map_err(plot_err)?;
            chart
                .configure_mesh()
                .x_label_formatter(&|v| format!("{:.1}%", v))
                .y_label_formatter(&|v| format!("{:.0}", v))
                .label_style((family, 14))
                .draw()
                .map_err(plot_err)?;

            chart
                .draw_series(counts.iter().enumerate().map(|(i, c)| {
                    let x0 = lo + i as f64 * width;
                    Rectangle::new([(x0, 0.0), (x0 + width, *c as f64)], BLUE.mix(0.5).filled())
                }))
                .map_err(plot_err)?;

            if let Ok(normal) = Normal::new(t.mean_return, t.std_return) {
                let scale = returns.len() as f64 * width;
                let steps = 200;
                chart
                    .draw_series(LineSeries::new(
                        (0..=steps).map(|k| {
                            let x = lo + (hi - lo) * k as f64 / steps as f64;
                            (x, normal.pdf(x) * scale)
                        }),
                        RED.stroke_width(2),
                    ))
                    .map_err(plot_err)?;
            }
        }

        root.present().map_err(plot_err)?;
        Ok(())
    }
}
