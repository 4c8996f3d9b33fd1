//! Scroll geometry for a message list.
//!
//! The session does not render anything. The host reports its viewport and
//! gets back what to do: nothing, preload the next older page, or load it
//! now. After older messages are prepended the host restores its position
//! from a [`ScrollAnchor`] so the message under the reader's eye stays put.

/// A scrollable list's geometry, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Distance scrolled from the top.
    pub scroll_top: f64,
    /// Total content height.
    pub scroll_height: f64,
    /// Visible height.
    pub client_height: f64,
}

impl Viewport {
    /// Pixels between the bottom of the visible area and the end of content.
    #[must_use]
    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.client_height - self.scroll_top).max(0.0)
    }

    /// Whether the viewport is within `threshold` pixels of the bottom.
    #[must_use]
    pub fn is_near_bottom(&self, threshold: f64) -> bool {
        self.distance_from_bottom() <= threshold
    }

    /// Scroll position as a fraction of the scrollable range, 0.0 at the top.
    /// Content that does not fill the viewport counts as being at the top.
    #[must_use]
    pub fn top_ratio(&self) -> f64 {
        let scrollable = self.scroll_height - self.client_height;
        if scrollable <= 0.0 {
            return 0.0;
        }
        (self.scroll_top / scrollable).clamp(0.0, 1.0)
    }
}

/// Position captured before a prepend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    scroll_top: f64,
    scroll_height: f64,
}

impl ScrollAnchor {
    /// Capture the viewport's offset and content height.
    #[must_use]
    pub const fn capture(viewport: &Viewport) -> Self {
        Self {
            scroll_top: viewport.scroll_top,
            scroll_height: viewport.scroll_height,
        }
    }

    /// The offset that keeps the same content in view once the content has
    /// grown to `new_height`.
    #[must_use]
    pub fn restore(&self, new_height: f64) -> f64 {
        self.scroll_top + (new_height - self.scroll_height)
    }
}

/// What a scroll position asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollIntent {
    /// Nothing to do.
    Idle,
    /// Close to the top: fetch the next older page in the background.
    Preload,
    /// At the top: show older messages now.
    LoadOlder,
}

impl ScrollIntent {
    /// Classify `viewport` against the preload and load thresholds (fractions
    /// of the scrollable range measured from the top).
    #[must_use]
    pub fn classify(viewport: &Viewport, preload_ratio: f64, load_ratio: f64) -> Self {
        let ratio = viewport.top_ratio();
        if ratio <= load_ratio {
            Self::LoadOlder
        } else if ratio <= preload_ratio {
            Self::Preload
        } else {
            Self::Idle
        }
    }
}
