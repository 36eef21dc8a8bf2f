//! Fixed-size OHLC rolling window.
//!
//! Four parallel series of length `W`, index 0 oldest and `W - 1` the most
//! recent bar. A trade tick provisionally occupies the still-open slot; the
//! bar for that minute finalizes it in place.

use chrono::{DateTime, Utc};
use recon_core::{Bar, TradeTick};
use rust_decimal::Decimal;

/// One of the four OHLC series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Series {
    Open,
    High,
    Low,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingWindow {
    open: Vec<Decimal>,
    high: Vec<Decimal>,
    low: Vec<Decimal>,
    close: Vec<Decimal>,
    bar_time: Option<DateTime<Utc>>,
    received_at: Option<DateTime<Utc>>,
    last_is_trade: bool,
    bar_close: Decimal,
}

fn roll(series: &mut [Decimal], value: Decimal) {
    series.rotate_left(1);
    if let Some(tail) = series.last_mut() {
        *tail = value;
    }
}

fn overwrite_tail(series: &mut [Decimal], value: Decimal) {
    if let Some(tail) = series.last_mut() {
        *tail = value;
    }
}

impl RollingWindow {
    /// Create a zero-filled window. A size of zero is raised to one.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            open: vec![Decimal::ZERO; size],
            high: vec![Decimal::ZERO; size],
            low: vec![Decimal::ZERO; size],
            close: vec![Decimal::ZERO; size],
            bar_time: None,
            received_at: None,
            last_is_trade: false,
            bar_close: Decimal::ZERO,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.close.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    /// Start of the most recent bar.
    #[must_use]
    pub fn bar_time(&self) -> Option<DateTime<Utc>> {
        self.bar_time
    }

    /// When the most recent bar or trade was received.
    #[must_use]
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
    }

    #[must_use]
    pub fn last_is_trade(&self) -> bool {
        self.last_is_trade
    }

    #[must_use]
    pub fn series(&self, series: Series) -> &[Decimal] {
        match series {
            Series::Open => &self.open,
            Series::High => &self.high,
            Series::Low => &self.low,
            Series::Close => &self.close,
        }
    }

    fn roll_all(&mut self, open: Decimal, high: Decimal, low: Decimal, close: Decimal) {
        roll(&mut self.open, open);
        roll(&mut self.high, high);
        roll(&mut self.low, low);
        roll(&mut self.close, close);
    }

    /// Apply a completed bar.
    ///
    /// Whole minutes missing since the previous bar are filled with flat
    /// bars at the last bar close. After a trade tick the provisional tail
    /// is finalized in place when the bar belongs to it, or becomes the
    /// first flat bar of the gap when it does not.
    pub fn update_on_bar(&mut self, bar: &Bar) {
        let missing = self.missing_minutes(bar.bar_time);
        let flat = self.bar_close;
        if self.last_is_trade && missing == 0 {
            self.overwrite_all(bar.open, bar.high, bar.low, bar.close);
        } else {
            let mut fills = missing;
            if self.last_is_trade {
                self.overwrite_all(flat, flat, flat, flat);
                fills -= 1;
            }
            for _ in 0..fills {
                self.roll_all(flat, flat, flat, flat);
            }
            self.roll_all(bar.open, bar.high, bar.low, bar.close);
        }
        self.bar_time = Some(bar.bar_time);
        self.received_at = Some(bar.received_at);
        self.bar_close = bar.close;
        self.last_is_trade = false;
    }

    /// Flat bars needed before a bar starting at `bar_time`, capped at the
    /// window length.
    fn missing_minutes(&self, bar_time: DateTime<Utc>) -> usize {
        let Some(previous) = self.bar_time else {
            return 0;
        };
        let missing = (bar_time - previous).num_minutes() - 1;
        usize::try_from(missing).unwrap_or(0).min(self.len())
    }

    fn overwrite_all(&mut self, open: Decimal, high: Decimal, low: Decimal, close: Decimal) {
        overwrite_tail(&mut self.open, open);
        overwrite_tail(&mut self.high, high);
        overwrite_tail(&mut self.low, low);
        overwrite_tail(&mut self.close, close);
    }

    /// Apply a trade tick to the open bar.
    ///
    /// The first tick after a bar opens a provisional slot at its price;
    /// later ticks move the close and widen the high and low.
    pub fn update_on_trade(&mut self, tick: &TradeTick) {
        let price = tick.price;
        if self.last_is_trade {
            let high = self.at(Series::High, 0).unwrap_or(price).max(price);
            let low = self.at(Series::Low, 0).unwrap_or(price).min(price);
            overwrite_tail(&mut self.high, high);
            overwrite_tail(&mut self.low, low);
            overwrite_tail(&mut self.close, price);
        } else {
            self.roll_all(price, price, price, price);
        }
        self.received_at = Some(tick.received_at);
        self.last_is_trade = true;
    }

    /// Value `n` steps back from the most recent (0 = most recent).
    #[must_use]
    pub fn at(&self, series: Series, n: usize) -> Option<Decimal> {
        let values = self.series(series);
        values
            .len()
            .checked_sub(n)?
            .checked_sub(1)
            .map(|i| values[i])
    }

    /// Most recent close.
    #[must_use]
    pub fn last_close(&self) -> Decimal {
        self.at(Series::Close, 0).unwrap_or_default()
    }

    /// Values between offsets `from` and `to` (either order), oldest first.
    /// Offsets past the oldest element are clamped.
    #[must_use]
    pub fn slice(&self, series: Series, from: usize, to: usize) -> Vec<Decimal> {
        let values = self.series(series);
        let len = values.len();
        let (near, far) = if from <= to { (from, to) } else { (to, from) };
        if near >= len {
            return Vec::new();
        }
        let far = far.min(len - 1);
        values[len - 1 - far..len - near].to_vec()
    }
}
