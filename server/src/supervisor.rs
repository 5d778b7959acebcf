//! Lifecycle management.
//!
//! Start, stop and restart arrive as [`Trigger`]s from whatever manages the agent
//! (signal handlers, a service manager, tests). The supervisor owns at most one
//! running server.

use std::{thread, time::Duration};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use dtf_common::SocketAddress;

use crate::{
    config::ServerConfig,
    server::{IpcServer, ServerHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Stop,
    /// Stop, wait for the cooldown, start
    Restart,
    /// Stop and leave [`Supervisor::run`]
    Shutdown,
}

pub struct Supervisor {
    server:   IpcServer,
    handle:   Option<ServerHandle>,
    cooldown: Duration,
}

impl Supervisor {
    pub fn new(config: ServerConfig) -> Self {
        let cooldown = config.restart_cooldown;
        Self {
            server: IpcServer::new(config),
            handle: None,
            cooldown,
        }
    }

    pub fn address(&self) -> &SocketAddress {
        &self.server.config().address
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(ServerHandle::is_running)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            tracing::debug!("Agent is already running, skipping start");
            return Ok(());
        }
        self.handle = Some(self.server.start()?);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.stop(),
            None => {
                tracing::debug!("Agent is not running, skipping stop");
                Ok(())
            }
        }
    }

    pub fn restart(&mut self) -> Result<()> {
        self.stop().context("Failed to stop agent for restart")?;
        if !self.cooldown.is_zero() {
            tracing::debug!("Cooling down for {:?} before restart", self.cooldown);
            thread::sleep(self.cooldown);
        }
        self.start().context("Failed to start agent after restart")
    }

    /// Applies one trigger; returns false once the supervisor should exit
    pub fn apply(&mut self, trigger: Trigger) -> Result<bool> {
        tracing::debug!("Lifecycle trigger: {:?}", trigger);
        match trigger {
            Trigger::Start => self.start()?,
            Trigger::Stop => self.stop()?,
            Trigger::Restart => self.restart()?,
            Trigger::Shutdown => {
                self.stop()?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Consumes triggers until `Shutdown` or until every sender is gone
    pub fn run(mut self, triggers: Receiver<Trigger>) -> Result<()> {
        for trigger in triggers.iter() {
            match self.apply(trigger) {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) => tracing::error!("{:?} failed: {:#}", trigger, e),
            }
        }
        tracing::info!("Trigger channel closed");
        self.stop()
    }
}
