//! Engine-independent scroll model for a message list.
//!
//! The view layer reports layout measurements (viewport and content
//! heights, scroll offset); this model answers the two questions the sync
//! core cares about: should a new message pull the viewport to the bottom,
//! and how much offset compensation does a history prepend need so the
//! anchor content does not visibly jump.

/// How close to the bottom (in pixels) the viewport must be for new
/// messages to auto-scroll it down. Further up means the user is reading
/// history and must not be yanked.
pub const BOTTOM_FOLLOW_THRESHOLD: f64 = 100.0;

#[derive(Debug, Clone, Default)]
pub struct ScrollState {
    /// Distance from the top of the content to the top of the viewport.
    offset: f64,
    viewport_height: f64,
    content_height: f64,
    /// Content height recorded when older rows were prepended, consumed by
    /// the next layout pass.
    pending_prepend: Option<f64>,
}

impl ScrollState {
    pub fn new(viewport_height: f64) -> Self {
        Self {
            viewport_height,
            ..Default::default()
        }
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn set_viewport_height(&mut self, height: f64) {
        self.viewport_height = height;
        self.clamp();
    }

    /// User-driven scroll.
    pub fn scroll_to(&mut self, offset: f64) {
        self.offset = offset;
        self.clamp();
    }

    pub fn scroll_to_bottom(&mut self) {
        self.offset = self.max_offset();
    }

    /// Whether the top sentinel is visible, i.e. the trigger condition for
    /// a backward history fetch.
    pub fn is_at_top(&self) -> bool {
        self.offset <= f64::EPSILON
    }

    pub fn is_near_bottom(&self) -> bool {
        self.max_offset() - self.offset <= BOTTOM_FOLLOW_THRESHOLD
    }

    /// Record that older content is about to be prepended. The compensating
    /// offset write happens in [`Self::apply_layout`], after the new rows
    /// have been measured.
    pub fn note_prepend(&mut self) {
        self.pending_prepend.get_or_insert(self.content_height);
    }

    /// Feed the freshly measured content height back in. If a prepend is
    /// pending, the growth above the viewport is added to the offset so the
    /// previously visible rows stay where they were.
    pub fn apply_layout(&mut self, content_height: f64) {
        if let Some(height_before) = self.pending_prepend.take() {
            self.offset += content_height - height_before;
        }
        self.content_height = content_height;
        self.clamp();
    }

    /// A new message grew the content. Follows it only when the viewport
    /// was already near the bottom; returns whether it did.
    pub fn on_new_message(&mut self, content_height: f64) -> bool {
        let follow = self.is_near_bottom();
        self.content_height = content_height;
        if follow {
            self.scroll_to_bottom();
        } else {
            self.clamp();
        }
        follow
    }

    fn max_offset(&self) -> f64 {
        (self.content_height - self.viewport_height).max(0.0)
    }

    fn clamp(&mut self) {
        self.offset = self.offset.clamp(0.0, self.max_offset());
    }
}
