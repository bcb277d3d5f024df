// src/controller.rs

use std::collections::VecDeque;
use std::fmt::Write as FmtWrite;
use std::io::{Write, stdout};
use std::time::Duration;

use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers, MouseButton, MouseEvent, MouseEventKind,
};
use crossterm::style::{Color, ResetColor, SetForegroundColor};
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    execute,
    terminal::{
        self, BeginSynchronizedUpdate, Clear, ClearType, EndSynchronizedUpdate, disable_raw_mode,
        enable_raw_mode,
    },
};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::annotations::{AnnotationLayer, AuthorId, ClickAction, ClickMode, CommentId, CommentStore};
use crate::engine::StemEngine;
use crate::session::{SessionEvent, StemStatus, TrackSession};
use crate::stem::{StemId, StemRecord};
use crate::timeline::{bar_is_played, format_time, time_to_x};
use crate::transport::TransportState;

const FRAME: Duration = Duration::from_millis(50);
const LABEL_WIDTH: u16 = 26;
const HEADER_ROWS: u16 = 3;
const ROWS_PER_STEM: u16 = 2;
const LEVELS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
const MAX_NOTICES: usize = 4;

/// A comment being typed before it is sent.
struct Draft {
    stem: StemId,
    timestamp: f64,
    text: String,
}

/// Terminal transport surface for one open track.
pub struct DeckController<E, S> {
    session: TrackSession<E>,
    events: UnboundedReceiver<SessionEvent>,
    comments: AnnotationLayer<S>,
    user: AuthorId,
    skip_secs: f64,

    selected: usize,
    mode: ClickMode,
    draft: Option<Draft>,
    loop_in: Option<f64>,
    focused_comment: Option<CommentId>,
    notices: VecDeque<String>,

    width: u16,
    draw_buffer: String,
}

impl<E, S> DeckController<E, S>
where
    E: StemEngine + 'static,
    S: CommentStore,
{
    pub fn new(
        session: TrackSession<E>,
        events: UnboundedReceiver<SessionEvent>,
        comments: AnnotationLayer<S>,
        user: AuthorId,
        skip_secs: f64,
    ) -> Self {
        let width = terminal::size().map(|(w, _)| w).unwrap_or(100);
        Self {
            session,
            events,
            comments,
            user,
            skip_secs,
            selected: 0,
            mode: ClickMode::Seek,
            draft: None,
            loop_in: None,
            focused_comment: None,
            notices: VecDeque::new(),
            width,
            draw_buffer: String::with_capacity(8192),
        }
    }

    /// Run until the user quits, then close the session.
    pub async fn run(mut self) -> anyhow::Result<()> {
        enable_raw_mode()?;
        execute!(stdout(), EnableMouseCapture, Hide, Clear(ClearType::All))?;

        if let Err(e) = self.comments.load_all().await {
            self.notify(format!("comments unavailable: {e}"));
        }
        let result = self.event_loop().await;

        let _ = execute!(stdout(), DisableMouseCapture, Show, ResetColor);
        let _ = disable_raw_mode();
        println!();
        self.session.close().await;
        result
    }

    async fn event_loop(&mut self) -> anyhow::Result<()> {
        loop {
            while event::poll(Duration::ZERO)? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        if self.handle_key(key).await {
                            return Ok(());
                        }
                    }
                    Event::Mouse(mouse) => self.handle_mouse(mouse),
                    Event::Resize(w, _) => {
                        self.width = w;
                        execute!(stdout(), Clear(ClearType::All))?;
                    }
                    _ => {}
                }
            }
            self.drain_events();
            self.draw()?;
            tokio::time::sleep(FRAME).await;
        }
    }

    fn notify(&mut self, msg: impl Into<String>) {
        self.notices.push_back(msg.into());
        while self.notices.len() > MAX_NOTICES {
            self.notices.pop_front();
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                SessionEvent::StemReady { stem, duration } => {
                    self.comments.set_stem_duration(&stem, duration);
                    self.notify(format!("{stem} ready ({})", format_time(duration)));
                }
                SessionEvent::StemFailed { stem, reason } => {
                    self.notify(format!("{stem} failed: {reason}"));
                }
                SessionEvent::EndOfTrack => self.notify("end of track"),
                SessionEvent::LoopWrapped { .. } => {}
            }
        }
    }

    fn strip_width(&self) -> u16 {
        self.width.saturating_sub(LABEL_WIDTH + 1).max(10)
    }

    fn stems(&self) -> Vec<StemRecord> {
        self.session.with_deck(|deck| deck.stems().to_vec())
    }

    fn selected_stem(&self) -> Option<StemId> {
        self.stems().get(self.selected).map(|s| s.id.clone())
    }

    // --- INPUT ---

    /// Returns true when the user asked to quit.
    async fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return true;
        }
        if self.draft.is_some() {
            self.handle_draft_key(key.code).await;
            return false;
        }

        let stem = self.selected_stem();
        match key.code {
            KeyCode::Char('q') | KeyCode::Char('Q') => return true,
            KeyCode::Char(' ') => self.session.with_deck(|d| d.toggle_play()),
            KeyCode::Left => {
                let delta = -self.skip_secs;
                self.session.with_deck(|d| d.skip(delta));
            }
            KeyCode::Right => {
                let delta = self.skip_secs;
                self.session.with_deck(|d| d.skip(delta));
            }
            KeyCode::Home => self.session.with_deck(|d| d.seek(0.0)),
            KeyCode::Up | KeyCode::Down => {
                if let Some(stem) = stem {
                    let step = if key.code == KeyCode::Up { 0.1 } else { -0.1 };
                    self.session.with_deck(|d| {
                        let v = d.state().volume_of(&stem);
                        d.set_volume(&stem, v + step);
                    });
                }
            }
            KeyCode::Tab => {
                let count = self.stems().len().max(1);
                self.selected = (self.selected + 1) % count;
            }
            KeyCode::Char(c @ '1'..='9') => {
                let idx = c as usize - '1' as usize;
                if idx < self.stems().len() {
                    self.selected = idx;
                }
            }
            KeyCode::Char('m') | KeyCode::Char('M') => {
                if let Some(stem) = stem {
                    if !self.session.with_deck(|d| d.toggle_mute(&stem)) {
                        self.notify("clear solo before muting");
                    }
                }
            }
            KeyCode::Char('s') | KeyCode::Char('S') => {
                if let Some(stem) = stem {
                    self.session.with_deck(|d| d.toggle_solo(&stem));
                }
            }
            KeyCode::Char('u') | KeyCode::Char('U') => self.session.with_deck(|d| d.unmute_all()),
            KeyCode::Char('l') | KeyCode::Char('L') => self.session.with_deck(|d| d.toggle_loop()),
            KeyCode::Char('i') | KeyCode::Char('I') => {
                self.loop_in = Some(self.session.state().current_time);
            }
            KeyCode::Char('o') | KeyCode::Char('O') => self.close_loop_region(),
            KeyCode::Char('x') | KeyCode::Char('X') => {
                self.loop_in = None;
                self.session.with_deck(|d| d.set_loop_region(None));
            }
            KeyCode::Char('-') => self.session.with_deck(|d| d.step_speed(false)),
            KeyCode::Char('=') | KeyCode::Char('+') => self.session.with_deck(|d| d.step_speed(true)),
            KeyCode::Char('a') | KeyCode::Char('A') => {
                self.mode = self.mode.toggled();
            }
            KeyCode::Char('c') | KeyCode::Char('C') => {
                if let Some(stem) = stem {
                    let timestamp = self.session.state().current_time;
                    self.start_draft(stem, timestamp);
                }
            }
            KeyCode::Char('n') | KeyCode::Char('N') => self.step_comment(true),
            KeyCode::Char('p') | KeyCode::Char('P') => self.step_comment(false),
            KeyCode::Delete | KeyCode::Backspace => self.delete_focused_comment().await,
            _ => {}
        }
        false
    }

    async fn handle_draft_key(&mut self, code: KeyCode) {
        let Some(draft) = self.draft.as_mut() else {
            return;
        };
        match code {
            KeyCode::Esc => self.draft = None,
            KeyCode::Backspace => {
                draft.text.pop();
            }
            KeyCode::Char(c) => draft.text.push(c),
            KeyCode::Enter => {
                if let Some(draft) = self.draft.take() {
                    let result = self
                        .comments
                        .create_comment(&draft.stem, draft.timestamp, &draft.text, &self.user)
                        .await
                        .map(|c| c.id.clone());
                    match result {
                        Ok(id) => self.focused_comment = Some(id),
                        Err(e) => self.notify(format!("comment not saved: {e}")),
                    }
                }
            }
            _ => {}
        }
    }

    fn start_draft(&mut self, stem: StemId, timestamp: f64) {
        self.draft = Some(Draft {
            stem,
            timestamp,
            text: String::new(),
        });
    }

    fn close_loop_region(&mut self) {
        let out = self.session.state().current_time;
        let Some(start) = self.loop_in else {
            self.notify("set a loop start with I first");
            return;
        };
        let (start, end) = if start <= out { (start, out) } else { (out, start) };
        if !self.session.with_deck(|d| d.set_loop_region(Some((start, end)))) {
            self.notify("loop region is empty");
        }
    }

    fn step_comment(&mut self, forward: bool) {
        let ordered: Vec<CommentId> = self
            .comments
            .comments_sorted()
            .into_iter()
            .map(|c| c.id.clone())
            .collect();
        if ordered.is_empty() {
            return;
        }
        let current = self
            .focused_comment
            .as_ref()
            .and_then(|id| ordered.iter().position(|c| c == id));
        let next = match (current, forward) {
            (None, true) => 0,
            (None, false) => ordered.len() - 1,
            (Some(i), true) => (i + 1) % ordered.len(),
            (Some(i), false) => (i + ordered.len() - 1) % ordered.len(),
        };
        let id = ordered[next].clone();
        let comments = &self.comments;
        let sought = self
            .session
            .with_deck(|deck| comments.seek_to_comment(&id, deck));
        match sought {
            Ok(_) => self.focused_comment = Some(id),
            Err(e) => self.notify(format!("{e}")),
        }
    }

    async fn delete_focused_comment(&mut self) {
        let Some(id) = self.focused_comment.clone() else {
            return;
        };
        match self.comments.delete_comment(&id, &self.user).await {
            Ok(()) => self.focused_comment = None,
            Err(e) => self.notify(format!("{e}")),
        }
    }

    fn handle_mouse(&mut self, mouse: MouseEvent) {
        if mouse.kind != MouseEventKind::Down(MouseButton::Left) {
            return;
        }
        if mouse.row < HEADER_ROWS || mouse.column < LABEL_WIDTH {
            return;
        }
        let idx = ((mouse.row - HEADER_ROWS) / ROWS_PER_STEM) as usize;
        let stems = self.stems();
        let Some(stem) = stems.get(idx) else {
            return;
        };
        self.selected = idx;

        let width = self.strip_width() as f64;
        let pixel_x = (mouse.column - LABEL_WIDTH) as f64 + 0.5;
        let duration = self.session.state().duration;
        let mode = self.mode;
        let comments = &self.comments;
        let action = self
            .session
            .with_deck(|deck| comments.click(mode, &stem.id, pixel_x, width, duration, deck));
        if let ClickAction::Annotate { stem, timestamp } = action {
            self.start_draft(stem, timestamp);
        }
    }

    // --- RENDERING ---

    pub fn draw(&mut self) -> anyhow::Result<()> {
        let state = self.session.state();
        let stems = self.stems();
        let statuses: Vec<Option<StemStatus>> = self
            .session
            .with_deck(|d| stems.iter().map(|s| d.status(&s.id).cloned()).collect());
        let strip = self.strip_width() as usize;

        self.draw_buffer.clear();
        let _ = write!(self.draw_buffer, "{}", MoveTo(0, 0));
        self.render_header(&state);
        if let Some(stem) = stems.get(self.selected) {
            let _ = write!(self.draw_buffer, "source: {}", stem.audio_source);
        }

        for (i, stem) in stems.iter().enumerate() {
            let row = HEADER_ROWS + i as u16 * ROWS_PER_STEM;
            let status = statuses.get(i).cloned().flatten();
            self.render_stem_row(row, i, stem, status.as_ref(), &state, strip);
            self.render_marker_row(row + 1, stem, &state, strip);
        }

        let mut row = HEADER_ROWS + stems.len() as u16 * ROWS_PER_STEM + 1;
        row = self.render_comment_list(row, &stems);
        self.render_footer(row);

        let mut out = stdout();
        execute!(out, BeginSynchronizedUpdate)?;
        out.write_all(self.draw_buffer.as_bytes())?;
        execute!(out, EndSynchronizedUpdate)?;
        out.flush()?;
        Ok(())
    }

    fn line(&mut self, row: u16) {
        let _ = write!(
            self.draw_buffer,
            "{}{}",
            MoveTo(0, row),
            Clear(ClearType::UntilNewLine)
        );
    }

    fn render_header(&mut self, state: &TransportState) {
        self.line(0);
        let icon = if state.is_playing { "▶" } else { "⏸" };
        let _ = write!(
            self.draw_buffer,
            "{icon} {} / {}   speed {:.2}x",
            format_time(state.current_time),
            format_time(state.duration),
            state.playback_speed
        );
        if state.is_looping {
            match state.loop_region {
                Some(r) => {
                    let _ = write!(
                        self.draw_buffer,
                        "   loop {}-{}",
                        format_time(r.start),
                        format_time(r.end)
                    );
                }
                None => {
                    let _ = write!(self.draw_buffer, "   loop track");
                }
            }
        }
        if let Some(solo) = &state.solo_stem {
            let _ = write!(self.draw_buffer, "   solo {solo}");
        }

        self.line(1);
        let mode = match self.mode {
            ClickMode::Seek => "click: seek",
            ClickMode::Annotate => "click: annotate",
        };
        let _ = write!(self.draw_buffer, "{mode}");
        if let Some(start) = self.loop_in {
            let _ = write!(self.draw_buffer, "   loop in at {}", format_time(start));
        }
        self.line(2);
    }

    fn render_stem_row(
        &mut self,
        row: u16,
        idx: usize,
        stem: &StemRecord,
        status: Option<&StemStatus>,
        state: &TransportState,
        strip: usize,
    ) {
        self.line(row);
        let cursor = if idx == self.selected { '>' } else { ' ' };
        let flags = format!(
            "{}{}",
            if state.is_muted(&stem.id) { 'M' } else { '-' },
            if state.solo_stem.as_ref() == Some(&stem.id) { 'S' } else { '-' }
        );
        let volume = (state.volume_of(&stem.id) * 100.0).round() as u32;
        let mut label: String = format!("{cursor}{} {flags} {volume:>3}%", stem.name);
        if label.chars().count() > LABEL_WIDTH as usize - 1 {
            let keep = LABEL_WIDTH as usize - 1;
            let trimmed: String = label.chars().take(keep).collect();
            label = trimmed;
        }
        let _ = write!(self.draw_buffer, "{label:<width$}", width = LABEL_WIDTH as usize);

        match status {
            Some(StemStatus::Ready { .. }) => {
                let played = hex_color(stem.color()).unwrap_or(Color::Green);
                let stem_duration = stem.duration.unwrap_or(state.duration);
                let mut current = None;
                for i in 0..strip {
                    let color = if bar_is_played(i, strip, state.duration, state.current_time) {
                        played
                    } else {
                        Color::DarkGrey
                    };
                    if current != Some(color) {
                        let _ = write!(self.draw_buffer, "{}", SetForegroundColor(color));
                        current = Some(color);
                    }
                    let level = bar_level(&stem.peaks, i, strip, state.duration, stem_duration);
                    self.draw_buffer.push(level);
                }
                let _ = write!(self.draw_buffer, "{}", ResetColor);
            }
            Some(StemStatus::Failed(reason)) => {
                let _ = write!(
                    self.draw_buffer,
                    "{}failed: {reason}{}",
                    SetForegroundColor(Color::Red),
                    ResetColor
                );
            }
            _ => {
                let _ = write!(self.draw_buffer, "loading...");
            }
        }
    }

    fn render_marker_row(&mut self, row: u16, stem: &StemRecord, state: &TransportState, strip: usize) {
        self.line(row);
        let mut cells = vec![' '; strip];
        for marker in self.comments.markers(&stem.id, state.duration, strip as f64) {
            let x = (marker.x as usize).min(strip.saturating_sub(1));
            cells[x] = if self.focused_comment.as_ref() == Some(&marker.comment) {
                '◆'
            } else {
                '▲'
            };
        }
        let head = time_to_x(state.current_time, state.duration, strip as f64) as usize;
        if let Some(cell) = cells.get_mut(head.min(strip.saturating_sub(1))) {
            if *cell == ' ' {
                *cell = '┴';
            }
        }
        let _ = write!(self.draw_buffer, "{:width$}", "", width = LABEL_WIDTH as usize);
        self.draw_buffer.extend(cells);
    }

    fn render_comment_list(&mut self, mut row: u16, stems: &[StemRecord]) -> u16 {
        self.line(row);
        let _ = write!(self.draw_buffer, "comments");
        row += 1;
        let lines: Vec<String> = self
            .comments
            .comments_sorted()
            .iter()
            .map(|c| {
                let stem = stems
                    .iter()
                    .find(|s| s.id == c.stem_id)
                    .map(|s| s.name.as_str())
                    .unwrap_or("?");
                let focus = if self.focused_comment.as_ref() == Some(&c.id) { '>' } else { ' ' };
                format!(
                    "{focus} {} {stem:<12} {}: {}",
                    format_time(c.timestamp),
                    c.author_id,
                    c.content
                )
            })
            .collect();
        for text in lines {
            self.line(row);
            let _ = write!(self.draw_buffer, "{text}");
            row += 1;
        }
        row
    }

    fn render_footer(&mut self, mut row: u16) {
        row += 1;
        let notices: Vec<String> = self.notices.iter().cloned().collect();
        for notice in notices {
            self.line(row);
            let _ = write!(self.draw_buffer, "· {notice}");
            row += 1;
        }
        self.line(row);
        if let Some(draft) = &self.draft {
            let _ = write!(
                self.draw_buffer,
                "comment on {} at {}: {}_  (Enter to save, Esc to cancel)",
                draft.stem,
                format_time(draft.timestamp),
                draft.text
            );
        } else {
            let _ = write!(
                self.draw_buffer,
                "[SPACE] play  [←/→] skip  [↑/↓] volume  [TAB/1-9] stem  [M]ute [S]olo [U]nmute all  \
                 [L]oop [I]n [O]ut [X] clear  [-/=] speed  [A]nnotate mode  [C]omment  [N/P] jump  [DEL] delete  [Q]uit"
            );
        }
        self.line(row + 1);
    }
}

/// Glyph for bar `i` of `bars`, using the stem's own peaks laid out against the
/// shared timeline. A stem shorter than the track is blank past its end.
fn bar_level(peaks: &[f32], i: usize, bars: usize, duration: f64, stem_duration: f64) -> char {
    if peaks.is_empty() || bars == 0 || !(duration > 0.0) || !(stem_duration > 0.0) {
        return LEVELS[0];
    }
    let t0 = i as f64 / bars as f64 * duration;
    let t1 = (i + 1) as f64 / bars as f64 * duration;
    if t0 >= stem_duration {
        return LEVELS[0];
    }
    let last = peaks.len() - 1;
    let lo = (((t0 / stem_duration) * peaks.len() as f64) as usize).min(last);
    let hi = (((t1 / stem_duration) * peaks.len() as f64).ceil() as usize).clamp(lo + 1, peaks.len());
    let peak = peaks[lo..hi]
        .iter()
        .fold(0.0f32, |m, p| m.max(*p));
    let idx = (peak.clamp(0.0, 1.0) * (LEVELS.len() - 1) as f32).round() as usize;
    LEVELS[idx.max(1)]
}

fn hex_color(hex: &str) -> Option<Color> {
    let hex = hex.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    Some(Color::Rgb {
        r: channel(0)?,
        g: channel(2)?,
        b: channel(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::annotations::InMemoryCommentStore;
    use crate::config::PlayerConfig;
    use crate::engine::{VirtualEngine, VirtualEngineFactory};

    async fn controller() -> DeckController<VirtualEngine, InMemoryCommentStore> {
        let stems = vec![
            StemRecord::new("vox", "Vocals", "vox.wav").with_duration(60.0),
            StemRecord::new("gtr", "Guitar", "gtr.wav").with_duration(60.0).with_sort_order(1),
        ];
        let comments = AnnotationLayer::new(InMemoryCommentStore::new(), &stems);
        let factory = Arc::new(VirtualEngineFactory::new());
        let (session, events) = TrackSession::open(stems, factory, &PlayerConfig::default());
        let mut ctl = DeckController::new(session, events, comments, AuthorId::new("u"), 5.0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        ctl.drain_events();
        ctl
    }

    #[tokio::test(start_paused = true)]
    async fn stepping_through_comments_seeks_the_deck() {
        let mut ctl = controller().await;
        let user = AuthorId::new("u");
        ctl.comments
            .create_comment(&StemId::new("gtr"), 40.0, "second", &user)
            .await
            .unwrap();
        ctl.comments
            .create_comment(&StemId::new("vox"), 12.0, "first", &user)
            .await
            .unwrap();

        ctl.step_comment(true);
        assert_eq!(ctl.session.state().current_time, 12.0);
        ctl.step_comment(true);
        assert_eq!(ctl.session.state().current_time, 40.0);
        ctl.step_comment(false);
        assert_eq!(ctl.session.state().current_time, 12.0);
        assert!(ctl.focused_comment.is_some());
        assert!(ctl.notices.iter().all(|n| !n.contains("not found")));

        ctl.session.close().await;
    }

    #[test]
    fn parses_stem_colors() {
        assert_eq!(
            hex_color("#348c32"),
            Some(Color::Rgb { r: 0x34, g: 0x8c, b: 0x32 })
        );
        assert_eq!(hex_color("348c32"), None);
        assert_eq!(hex_color("#zzzzzz"), None);
    }

    #[test]
    fn short_stem_is_blank_past_its_end() {
        let peaks = vec![1.0; 10];
        assert_eq!(bar_level(&peaks, 0, 10, 20.0, 10.0), '█');
        assert_eq!(bar_level(&peaks, 4, 10, 20.0, 10.0), '█');
        assert_eq!(bar_level(&peaks, 5, 10, 20.0, 10.0), ' ');
        assert_eq!(bar_level(&[], 0, 10, 20.0, 10.0), ' ');
    }

    #[test]
    fn bar_right_before_stem_end_stays_in_bounds() {
        let peaks = vec![0.5; 3];
        for bars in [3usize, 7, 64, 1000] {
            let duration = 1.0;
            let i = bars - 1;
            let t0 = i as f64 / bars as f64 * duration;
            let stem_duration = f64::from_bits(t0.to_bits() + 1);
            assert_eq!(bar_level(&peaks, i, bars, duration, stem_duration), '▄');
        }
        assert_eq!(bar_level(&[1.0], 0, 1, 1.0, f64::MIN_POSITIVE), '█');
    }

    #[test]
    fn quiet_audio_still_draws_a_floor() {
        assert_eq!(bar_level(&[0.0, 0.0], 0, 2, 2.0, 2.0), '▁');
        assert_eq!(bar_level(&[0.5, 0.5], 1, 2, 2.0, 2.0), '▄');
    }
}
