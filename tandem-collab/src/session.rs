//! Per-document synchronization session.
//!
//! A [`ClientSession`] owns one document's [`Sequence`], translates editor
//! changes into TEXT operations and applies remote operations back to the
//! editor. Both event sources are fed in by the caller one at a time.
//!
//! ```text
//!            on_connected          AVAILABLE            INITIAL
//! Connecting ───────────► Handshaking ──┬─────────────────────────────► Synchronized   (host)
//!                                       │
//!                          AwaitingAssignment ──► AwaitingSnapshot ───► Synchronized   (guest)
//!
//! any fatal error ──► Closed
//! ```

use std::collections::VecDeque;

use tandem_core::{Pid, Sequence, SequenceError, SiteId};

use crate::echo::{EchoGuard, PendingEdit};
use crate::editor::{DocumentId, EditorError, EditorSurface, TextChange};
use crate::protocol::{Available, Info, Initial, Message, Operation, ProtocolError};
use crate::transport::{Outbound, TransportError};

/// Which side of the share this replica is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the original document and serves snapshots
    Host,
    /// Joins a hosted document
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    AwaitingAssignment,
    AwaitingSnapshot,
    Synchronized,
    Closed,
}

/// Session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Name announced in INFO
    pub username: String,
    /// Client kind announced in INFO
    pub client_kind: String,
    /// Whether this deployment may host documents
    pub hosting_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: "anonymous".to_string(),
            client_kind: "tandem".to_string(),
            hosting_enabled: true,
        }
    }
}

/// The host's name for the shared buffer, received with the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBuffer {
    pub name: String,
    pub reference: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("relay reported a guest as the first member of the room")]
    GuestIsFirst,
    #[error("session sharing is not supported")]
    SessionShareUnsupported,
    #[error("no editor view for document {0}")]
    NoView(DocumentId),
    #[error("hosting is not available in this deployment")]
    HostingUnavailable,
    #[error("document {0} is already shared")]
    AlreadyShared(DocumentId),
    #[error("session is not synchronized")]
    NotSynchronized,
    #[error("change at {offset}+{length} outside document of {len} characters")]
    RangeOutOfBounds {
        offset: usize,
        length: usize,
        len: usize,
    },
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid snapshot: {0}")]
    Snapshot(#[from] SequenceError),
    #[error(transparent)]
    Editor(#[from] EditorError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Whether the session must be closed after this error.
    ///
    /// Malformed frames and rejected local edits leave the session usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::GuestIsFirst
                | SessionError::SessionShareUnsupported
                | SessionError::NoView(_)
                | SessionError::Snapshot(_)
                | SessionError::Editor(_)
                | SessionError::Transport(_)
        )
    }
}

/// Synchronization state for one shared document.
pub struct ClientSession<O> {
    document: DocumentId,
    role: Role,
    state: SessionState,
    config: SessionConfig,
    site: Option<SiteId>,
    sequence: Sequence,
    /// Host text waiting for a site to generate identifiers with.
    initial_text: Option<String>,
    echo: EchoGuard,
    /// Operations received before the snapshot.
    pending: VecDeque<Operation>,
    remote_buffer: Option<RemoteBuffer>,
    outbound: O,
}

impl<O: Outbound> ClientSession<O> {
    /// Start hosting `document` whose current content is `text`.
    pub fn host(
        document: DocumentId,
        text: impl Into<String>,
        config: SessionConfig,
        outbound: O,
    ) -> Result<Self, SessionError> {
        if !config.hosting_enabled {
            return Err(SessionError::HostingUnavailable);
        }
        let mut session = Self::new(document, Role::Host, config, outbound);
        session.initial_text = Some(text.into());
        Ok(session)
    }

    /// Join a document hosted by another replica.
    pub fn guest(document: DocumentId, config: SessionConfig, outbound: O) -> Self {
        Self::new(document, Role::Guest, config, outbound)
    }

    fn new(document: DocumentId, role: Role, config: SessionConfig, outbound: O) -> Self {
        Self {
            document,
            role,
            state: SessionState::Connecting,
            config,
            site: None,
            sequence: Sequence::new(),
            initial_text: None,
            echo: EchoGuard::new(),
            pending: VecDeque::new(),
            remote_buffer: None,
            outbound,
        }
    }

    /// The transport is up: introduce ourselves.
    pub fn on_connected(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connecting {
            return Ok(());
        }
        self.state = SessionState::Handshaking;
        let info = Message::Info(Info {
            session_share: false,
            username: self.config.username.clone(),
            client_kind: self.config.client_kind.clone(),
        });
        let result = self.send(&info);
        self.check(result)?;

        if self.role == Role::Guest {
            self.state = SessionState::AwaitingAssignment;
        }
        log::info!("{} {:?} handshaking as {}", self.document, self.role, self.config.username);
        Ok(())
    }

    /// Handle one inbound frame.
    ///
    /// A frame that fails to decode is rejected without touching the session.
    /// Fatal errors close the session before they are returned.
    pub fn handle_frame(
        &mut self,
        bytes: &[u8],
        editor: &mut dyn EditorSurface,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("{}: rejected inbound frame: {}", self.document, e);
                return Err(e.into());
            }
        };
        let result = self.handle_message(message, editor);
        self.check(result)
    }

    fn handle_message(
        &mut self,
        message: Message,
        editor: &mut dyn EditorSurface,
    ) -> Result<(), SessionError> {
        match message {
            Message::Available(available) => self.on_available(available),
            Message::Initial(initial) => self.on_initial(initial, editor),
            Message::Request => self.on_request(),
            Message::Text(operation) => self.on_operation(operation, editor),
            Message::Info(_) => {
                log::warn!("{}: ignoring INFO sent to a client", self.document);
                Ok(())
            }
        }
    }

    fn on_available(&mut self, available: Available) -> Result<(), SessionError> {
        if self.site.is_some() {
            log::warn!("{}: ignoring repeated AVAILABLE", self.document);
            return Ok(());
        }
        if self.role == Role::Guest && available.is_first {
            return Err(SessionError::GuestIsFirst);
        }
        if available.session_share {
            return Err(SessionError::SessionShareUnsupported);
        }

        self.site = Some(available.site);
        match self.role {
            Role::Host => {
                if !available.is_first {
                    log::warn!("{}: hosting in a room that already has members", self.document);
                }
                let text = self.initial_text.take().unwrap_or_default();
                self.sequence = Sequence::from_text(available.site, &text);
                self.state = SessionState::Synchronized;
            }
            Role::Guest => {
                self.state = SessionState::AwaitingSnapshot;
                self.send(&Message::Request)?;
            }
        }
        log::info!("{}: assigned site {}", self.document, available.site);
        Ok(())
    }

    fn on_initial(
        &mut self,
        initial: Initial,
        editor: &mut dyn EditorSurface,
    ) -> Result<(), SessionError> {
        if self.role == Role::Host || self.state != SessionState::AwaitingSnapshot {
            log::debug!("{}: ignoring INITIAL in state {:?}", self.document, self.state);
            return Ok(());
        }
        if editor.locate_view(&self.document).is_none() {
            return Err(SessionError::NoView(self.document.clone()));
        }

        self.sequence.load_snapshot(&initial.snapshot)?;
        self.remote_buffer = Some(RemoteBuffer {
            name: initial.buffer_name,
            reference: initial.buffer_ref,
        });

        let text = self.sequence.text();
        self.echo.expect(PendingEdit::Materialize { text: text.clone() });
        if let Err(e) = editor.materialize(&self.document, &text) {
            self.echo.withdraw();
            return Err(e.into());
        }
        self.state = SessionState::Synchronized;
        log::info!(
            "{}: synchronized with {} characters, replaying {} queued operation(s)",
            self.document,
            self.sequence.len(),
            self.pending.len()
        );

        while let Some(operation) = self.pending.pop_front() {
            self.apply_remote(operation, editor)?;
        }
        Ok(())
    }

    fn on_request(&mut self) -> Result<(), SessionError> {
        if self.role != Role::Host || self.state != SessionState::Synchronized {
            log::debug!("{}: ignoring REQUEST", self.document);
            return Ok(());
        }
        let initial = Message::Initial(Initial {
            buffer_name: self.document.name().to_string(),
            buffer_ref: self.document.0.clone(),
            snapshot: self.sequence.snapshot(),
        });
        log::debug!("{}: serving snapshot", self.document);
        self.send(&initial)
    }

    fn on_operation(
        &mut self,
        operation: Operation,
        editor: &mut dyn EditorSurface,
    ) -> Result<(), SessionError> {
        match self.state {
            SessionState::Synchronized => self.apply_remote(operation, editor),
            SessionState::AwaitingSnapshot => {
                self.pending.push_back(operation);
                Ok(())
            }
            state => {
                log::warn!("{}: dropping operation in state {:?}", self.document, state);
                Ok(())
            }
        }
    }

    fn apply_remote(
        &mut self,
        operation: Operation,
        editor: &mut dyn EditorSurface,
    ) -> Result<(), SessionError> {
        if editor.locate_view(&self.document).is_none() {
            return Err(SessionError::NoView(self.document.clone()));
        }

        let applied = match operation {
            Operation::Insert { ch, pid } => match self.sequence.insert(pid, ch) {
                Some(offset) => {
                    let text = ch.to_string();
                    self.echo.expect(PendingEdit::Insert {
                        offset,
                        text: text.clone(),
                    });
                    editor.apply_insert(&self.document, offset, &text)
                }
                None => return Ok(()),
            },
            Operation::Delete { pid, .. } => match self.sequence.delete(&pid) {
                Some((offset, _)) => {
                    self.echo.expect(PendingEdit::Delete { offset, length: 1 });
                    editor.apply_delete(&self.document, offset, 1)
                }
                None => return Ok(()),
            },
        };

        applied.map_err(|e| {
            self.echo.withdraw();
            e.into()
        })
    }

    /// Feed a change event from the editor.
    ///
    /// Echoes of our own programmatic edits are swallowed. Anything else is a
    /// local edit: deleted characters are sent and removed first, then inserted
    /// characters are generated, inserted and sent one by one.
    pub fn report_change(&mut self, change: &TextChange) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.echo.consume(change) {
            return Ok(());
        }
        let result = self.local_edit(change);
        self.check(result)
    }

    fn local_edit(&mut self, change: &TextChange) -> Result<(), SessionError> {
        // A host without a site keeps editing plain text; identifiers are
        // generated from it once AVAILABLE arrives.
        if let Some(text) = self.initial_text.as_mut() {
            return edit_plain_text(text, change);
        }
        let site = match (self.state, self.site) {
            (SessionState::Synchronized, Some(site)) => site,
            _ => return Err(SessionError::NotSynchronized),
        };
        change_end(change, self.sequence.len())?;

        if change.range_length > 0 {
            self.delete_range(change.range_offset, change.range_length)?;
        }
        if !change.text.is_empty() {
            self.insert_text(site, change.range_offset, &change.text)?;
        }
        Ok(())
    }

    fn delete_range(&mut self, offset: usize, length: usize) -> Result<(), SessionError> {
        let pids: Vec<Pid> = (offset..offset + length)
            .filter_map(|o| self.sequence.pid_at(o).cloned())
            .collect();
        for pid in pids {
            let Some(ch) = self.sequence.char_at(&pid) else {
                continue;
            };
            self.send(&Message::Text(Operation::Delete {
                pid: pid.clone(),
                ch,
            }))?;
            self.sequence.delete(&pid);
        }
        Ok(())
    }

    fn insert_text(&mut self, site: SiteId, offset: usize, text: &str) -> Result<(), SessionError> {
        for (i, ch) in text.chars().enumerate() {
            let pid = self.sequence.generate_at(site, offset + i);
            self.sequence.insert(pid.clone(), ch);
            self.send(&Message::Text(Operation::Insert { ch, pid }))?;
        }
        Ok(())
    }

    fn send(&mut self, message: &Message) -> Result<(), SessionError> {
        let frame = message.encode()?;
        self.outbound.send_frame(frame)?;
        Ok(())
    }

    /// Close the session on fatal errors.
    fn check<T>(&mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("{}: closing session: {}", self.document, e);
                self.close();
            } else {
                log::warn!("{}: {}", self.document, e);
            }
        }
        result
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.echo.clear();
        self.pending.clear();
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_synchronized(&self) -> bool {
        self.state == SessionState::Synchronized
    }

    pub fn site(&self) -> Option<SiteId> {
        self.site
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn text(&self) -> String {
        self.sequence.text()
    }

    pub fn remote_buffer(&self) -> Option<&RemoteBuffer> {
        self.remote_buffer.as_ref()
    }

    /// Number of programmatic edits whose echo has not been seen yet.
    pub fn pending_echoes(&self) -> usize {
        self.echo.len()
    }

    pub fn outbound(&self) -> &O {
        &self.outbound
    }

    pub fn outbound_mut(&mut self) -> &mut O {
        &mut self.outbound
    }
}

/// End offset of `change`, if it lies within a document of `len` characters.
fn change_end(change: &TextChange, len: usize) -> Result<usize, SessionError> {
    match change.range_offset.checked_add(change.range_length) {
        Some(end) if end <= len => Ok(end),
        _ => Err(SessionError::RangeOutOfBounds {
            offset: change.range_offset,
            length: change.range_length,
            len,
        }),
    }
}

fn edit_plain_text(text: &mut String, change: &TextChange) -> Result<(), SessionError> {
    let end = change_end(change, text.chars().count())?;
    let byte_at = |offset: usize| {
        text.char_indices()
            .nth(offset)
            .map_or(text.len(), |(index, _)| index)
    };
    let range = byte_at(change.range_offset)..byte_at(end);
    text.replace_range(range, &change.text);
    Ok(())
}
