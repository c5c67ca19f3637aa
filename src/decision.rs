//! Pending decisions for implicitly blocked devices
//!
//! [`DecisionQueue`] shows one prompt at a time through an injected prompt
//! function and answers every request by its deadline. A request nobody
//! answers in time gets the configured default target.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::DecisionSettings;
use crate::rule::{Rule, Target};

/// Answer channel of a shown prompt; `None` means dismissed
pub type Answer = oneshot::Receiver<Option<Target>>;

/// What a prompt should ask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub id: u32,
    /// Device description
    pub text: String,
    pub choices: Vec<Target>,
    /// Index into `choices` to preselect
    pub default: usize,
    /// Target applied when the prompt goes unanswered
    pub default_target: Target,
    /// Time left before the default applies
    pub remaining: Duration,
}

/// Resolved request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub id: u32,
    pub target: Target,
    /// No answer arrived before the deadline
    pub timed_out: bool,
}

#[derive(Debug)]
struct Request {
    id: u32,
    text: String,
    deadline: Instant,
}

/// Requests waiting for the user, shown one at a time
///
/// A prompt that timed out may still hold the terminal; the next prompt is
/// shown only once it has been dismissed, and its late answer is dropped.
/// Queued requests keep their own deadlines meanwhile.
pub struct DecisionQueue<P> {
    settings: DecisionSettings,
    show: P,
    queue: VecDeque<Request>,
    active: Option<(Request, Answer)>,
    abandoned: Option<Answer>,
}

impl<P: FnMut(Prompt) -> Answer> DecisionQueue<P> {
    pub fn new(settings: DecisionSettings, show: P) -> Self {
        Self {
            settings,
            show,
            queue: VecDeque::new(),
            active: None,
            abandoned: None,
        }
    }

    /// Ask about a device; its deadline starts now
    ///
    /// A device already waiting for an answer is not asked twice.
    pub fn push(&mut self, id: u32, rule: &Rule, serial: &str) {
        let mut waiting = self.active.iter().map(|(r, _)| r).chain(&self.queue);
        if waiting.any(|r| r.id == id) {
            tracing::debug!(id, "decision already pending");
            return;
        }

        self.queue.push_back(Request {
            id,
            text: describe(id, rule, serial),
            deadline: Instant::now() + self.settings.timeout,
        });
    }

    /// Requests not yet resolved
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len() + usize::from(self.active.is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next answered or expired request
    ///
    /// Pending forever while nothing is queued. Cancel safe.
    pub async fn next(&mut self) -> Decision {
        loop {
            let now = Instant::now();
            if let Some(request) = self
                .queue
                .iter()
                .position(|r| r.deadline <= now)
                .and_then(|pos| self.queue.remove(pos))
            {
                return self.expired(request.id);
            }
            self.show_next();

            let wake = self
                .queue
                .iter()
                .map(|r| r.deadline)
                .chain(self.active.as_ref().map(|(r, _)| r.deadline))
                .min();

            tokio::select! {
                answer = answered(self.active.as_mut().map(|(_, rx)| rx)) => {
                    if let Some((request, _)) = self.active.take() {
                        return Decision {
                            id: request.id,
                            target: answer.unwrap_or(self.settings.default_target),
                            timed_out: false,
                        };
                    }
                }
                late = answered(self.abandoned.as_mut()) => {
                    tracing::debug!(answer = ?late, "answer after timeout ignored");
                    self.abandoned = None;
                }
                () = until(wake) => {
                    let now = Instant::now();
                    if let Some((request, rx)) = self.active.take_if(|(r, _)| r.deadline <= now) {
                        self.abandoned = Some(rx);
                        return self.expired(request.id);
                    }
                }
            }
        }
    }

    fn expired(&self, id: u32) -> Decision {
        tracing::info!(id, target = %self.settings.default_target, "no decision in time, using default");
        Decision {
            id,
            target: self.settings.default_target,
            timed_out: true,
        }
    }

    fn show_next(&mut self) {
        if self.active.is_some() || self.abandoned.is_some() {
            return;
        }
        let Some(request) = self.queue.pop_front() else {
            return;
        };

        let mut choices = vec![Target::Allow, Target::Block];
        if self.settings.show_reject {
            choices.push(Target::Reject);
        }
        let default = choices
            .iter()
            .position(|t| *t == self.settings.default_target)
            .unwrap_or(1);

        let answer = (self.show)(Prompt {
            id: request.id,
            text: request.text.clone(),
            choices,
            default,
            default_target: self.settings.default_target,
            remaining: request.deadline.saturating_duration_since(Instant::now()),
        });
        self.active = Some((request, answer));
    }
}

fn describe(id: u32, rule: &Rule, serial: &str) -> String {
    let interfaces: Vec<String> = rule
        .interface_types()
        .values
        .iter()
        .map(ToString::to_string)
        .collect();
    format!(
        "Device {id} blocked: {name} [{usb_id}] serial {serial} interfaces {interfaces}",
        name = rule.name(),
        usb_id = rule.device_id().map(ToString::to_string).unwrap_or_default(),
        interfaces = interfaces.join(" "),
    )
}

async fn answered(answer: Option<&mut Answer>) -> Option<Target> {
    match answer {
        Some(rx) => rx.await.ok().flatten(),
        None => std::future::pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
