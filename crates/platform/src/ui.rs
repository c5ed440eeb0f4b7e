/// Fire-and-forget status sinks toward whatever front-end hosts the machine.
/// Implementations must not block; the core never waits on the UI.
pub trait UiSink {
    fn status_icon(&mut self, _tag: &str, _active: bool) {}
    fn status_text(&mut self, _text: &str) {}
    fn window_title(&mut self, _title: &str) {}
}

/// Discards everything; the default sink.
#[derive(Default)]
pub struct NullUiSink;

impl UiSink for NullUiSink {}
