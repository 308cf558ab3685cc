//! Registry of shared documents.
//!
//! The manager owns one [`ClientSession`] per document and routes editor changes
//! and transport events to it. Sessions that hit a fatal error are dropped.

use std::collections::HashMap;

use crate::editor::{DocumentId, EditorSurface, TextChange};
use crate::session::{ClientSession, SessionConfig, SessionError};
use crate::transport::{Outbound, TransportEvent};

pub struct SessionManager<O> {
    config: SessionConfig,
    sessions: HashMap<DocumentId, ClientSession<O>>,
}

impl<O: Outbound> SessionManager<O> {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    /// Share `document` as host. `outbound` must already be connected.
    pub fn start_host(
        &mut self,
        document: DocumentId,
        text: impl Into<String>,
        outbound: O,
    ) -> Result<&mut ClientSession<O>, SessionError> {
        self.ensure_unshared(&document)?;
        let session = ClientSession::host(document, text, self.config.clone(), outbound)?;
        self.register(session)
    }

    /// Join `document` as guest. `outbound` must already be connected.
    pub fn join(
        &mut self,
        document: DocumentId,
        outbound: O,
    ) -> Result<&mut ClientSession<O>, SessionError> {
        self.ensure_unshared(&document)?;
        let session = ClientSession::guest(document, self.config.clone(), outbound);
        self.register(session)
    }

    fn ensure_unshared(&self, document: &DocumentId) -> Result<(), SessionError> {
        if self.sessions.contains_key(document) {
            return Err(SessionError::AlreadyShared(document.clone()));
        }
        Ok(())
    }

    fn register(&mut self, mut session: ClientSession<O>) -> Result<&mut ClientSession<O>, SessionError> {
        session.on_connected()?;
        let document = session.document().clone();
        log::info!("Sharing {document} as {:?}", session.role());
        Ok(self.sessions.entry(document).or_insert(session))
    }

    /// Route an editor change. Changes to documents that are not shared are
    /// ignored.
    pub fn report_change(
        &mut self,
        document: &DocumentId,
        change: &TextChange,
    ) -> Result<(), SessionError> {
        let Some(session) = self.sessions.get_mut(document) else {
            return Ok(());
        };
        let result = session.report_change(change);
        self.drop_if_fatal(document, result)
    }

    /// Route an inbound frame for `document`.
    pub fn handle_frame(
        &mut self,
        document: &DocumentId,
        bytes: &[u8],
        editor: &mut dyn EditorSurface,
    ) -> Result<(), SessionError> {
        let Some(session) = self.sessions.get_mut(document) else {
            log::debug!("Dropping frame for unshared document {document}");
            return Ok(());
        };
        let result = session.handle_frame(bytes, editor);
        self.drop_if_fatal(document, result)
    }

    pub fn handle_transport_event(
        &mut self,
        document: &DocumentId,
        event: TransportEvent,
        editor: &mut dyn EditorSurface,
    ) -> Result<(), SessionError> {
        match event {
            TransportEvent::Frame(bytes) => self.handle_frame(document, &bytes, editor),
            TransportEvent::Closed => {
                if self.close(document).is_some() {
                    log::info!("Transport for {document} closed");
                }
                Ok(())
            }
        }
    }

    fn drop_if_fatal(
        &mut self,
        document: &DocumentId,
        result: Result<(), SessionError>,
    ) -> Result<(), SessionError> {
        if matches!(&result, Err(e) if e.is_fatal()) {
            self.sessions.remove(document);
        }
        result
    }

    /// Stop sharing `document`.
    pub fn close(&mut self, document: &DocumentId) -> Option<ClientSession<O>> {
        let mut session = self.sessions.remove(document)?;
        session.close();
        Some(session)
    }

    pub fn get(&self, document: &DocumentId) -> Option<&ClientSession<O>> {
        self.sessions.get(document)
    }

    pub fn get_mut(&mut self, document: &DocumentId) -> Option<&mut ClientSession<O>> {
        self.sessions.get_mut(document)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentId> {
        self.sessions.keys()
    }
}
