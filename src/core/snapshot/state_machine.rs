use super::error::{DecodeError, ManualReason};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Loading,
    Extracting { index: usize, total: usize },
    Succeeded { url: String },
    ManualFallback { reason: ManualReason },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Start,
    /// 解码器就绪，本次会话规划出 `candidates` 个候选时间点
    Prepared { candidates: usize },
    PrepareFailed(DecodeError),
    FrameBlack,
    UploadFailed,
    Uploaded { url: String },
    CaptureFailed(DecodeError),
    DeadlineExpired,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionAction {
    Prepare,
    Capture { index: usize },
    /// 进入终态，由调用方上报结果
    Finish,
    /// 终态下收到的事件，丢弃
    Ignore,
}

impl SessionState {
    pub fn new() -> Self {
        SessionState::Idle
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded { .. }
                | SessionState::ManualFallback { .. }
                | SessionState::Error { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Loading => "loading",
            SessionState::Extracting { .. } => "extracting",
            SessionState::Succeeded { .. } => "succeeded",
            SessionState::ManualFallback { .. } => "manual-fallback",
            SessionState::Error { .. } => "error",
        }
    }

    /// Pure transition function. Terminal states absorb every event.
    pub fn transition(&self, event: SessionEvent) -> (SessionState, SessionAction) {
        if self.is_terminal() {
            return (self.clone(), SessionAction::Ignore);
        }

        match (self, event) {
            (_, SessionEvent::DeadlineExpired) => (
                SessionState::ManualFallback {
                    reason: ManualReason::Timeout,
                },
                SessionAction::Finish,
            ),

            (SessionState::Idle, SessionEvent::Start) => {
                (SessionState::Loading, SessionAction::Prepare)
            }

            (SessionState::Loading, SessionEvent::Prepared { candidates }) => {
                if candidates == 0 {
                    (
                        SessionState::ManualFallback {
                            reason: ManualReason::Exhausted,
                        },
                        SessionAction::Finish,
                    )
                } else {
                    (
                        SessionState::Extracting {
                            index: 0,
                            total: candidates,
                        },
                        SessionAction::Capture { index: 0 },
                    )
                }
            }

            (SessionState::Loading, SessionEvent::PrepareFailed(err)) => (
                SessionState::ManualFallback {
                    reason: ManualReason::Decode(err),
                },
                SessionAction::Finish,
            ),

            (SessionState::Extracting { .. }, SessionEvent::Uploaded { url }) => {
                (SessionState::Succeeded { url }, SessionAction::Finish)
            }

            (
                SessionState::Extracting { index, total },
                SessionEvent::FrameBlack | SessionEvent::UploadFailed,
            ) => {
                let next = index + 1;
                if next >= *total {
                    (
                        SessionState::ManualFallback {
                            reason: ManualReason::Exhausted,
                        },
                        SessionAction::Finish,
                    )
                } else {
                    (
                        SessionState::Extracting {
                            index: next,
                            total: *total,
                        },
                        SessionAction::Capture { index: next },
                    )
                }
            }

            (SessionState::Extracting { .. }, SessionEvent::CaptureFailed(err)) => (
                SessionState::ManualFallback {
                    reason: ManualReason::Decode(err),
                },
                SessionAction::Finish,
            ),

            (state, event) => (
                SessionState::Error {
                    message: format!("unexpected {:?} while {}", event, state.name()),
                },
                SessionAction::Finish,
            ),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(events: Vec<SessionEvent>) -> (SessionState, Vec<SessionAction>) {
        let mut state = SessionState::new();
        let mut actions = Vec::new();
        for event in events {
            let (next, action) = state.transition(event);
            state = next;
            actions.push(action);
        }
        (state, actions)
    }

    #[test]
    fn test_idle_to_loading() {
        let (state, actions) = run(vec![SessionEvent::Start]);
        assert_eq!(state, SessionState::Loading);
        assert_eq!(actions, vec![SessionAction::Prepare]);
    }

    #[test]
    fn test_black_then_uploaded() {
        let (state, actions) = run(vec![
            SessionEvent::Start,
            SessionEvent::Prepared { candidates: 4 },
            SessionEvent::FrameBlack,
            SessionEvent::Uploaded {
                url: "https://cdn/a.jpg".into(),
            },
        ]);
        assert_eq!(
            state,
            SessionState::Succeeded {
                url: "https://cdn/a.jpg".into()
            }
        );
        assert_eq!(
            actions,
            vec![
                SessionAction::Prepare,
                SessionAction::Capture { index: 0 },
                SessionAction::Capture { index: 1 },
                SessionAction::Finish,
            ]
        );
    }

    #[test]
    fn test_upload_failure_advances_like_black() {
        let (state, actions) = run(vec![
            SessionEvent::Start,
            SessionEvent::Prepared { candidates: 2 },
            SessionEvent::UploadFailed,
        ]);
        assert_eq!(state, SessionState::Extracting { index: 1, total: 2 });
        assert_eq!(actions.last(), Some(&SessionAction::Capture { index: 1 }));
    }

    #[test]
    fn test_exhaustion_after_last_candidate() {
        let (state, actions) = run(vec![
            SessionEvent::Start,
            SessionEvent::Prepared { candidates: 4 },
            SessionEvent::FrameBlack,
            SessionEvent::FrameBlack,
            SessionEvent::UploadFailed,
            SessionEvent::FrameBlack,
        ]);
        assert_eq!(
            state,
            SessionState::ManualFallback {
                reason: ManualReason::Exhausted
            }
        );
        let captures = actions
            .iter()
            .filter(|a| matches!(a, SessionAction::Capture { .. }))
            .count();
        assert_eq!(captures, 4);
    }

    #[test]
    fn test_prepare_failure_goes_straight_to_manual() {
        let err = DecodeError::unsupported("hevc");
        let (state, actions) = run(vec![SessionEvent::Start, SessionEvent::PrepareFailed(err.clone())]);
        assert_eq!(
            state,
            SessionState::ManualFallback {
                reason: ManualReason::Decode(err)
            }
        );
        assert!(!actions.iter().any(|a| matches!(a, SessionAction::Capture { .. })));
    }

    #[test]
    fn test_capture_failure_stops_extraction() {
        let (state, _) = run(vec![
            SessionEvent::Start,
            SessionEvent::Prepared { candidates: 4 },
            SessionEvent::CaptureFailed(DecodeError::failure("seek timed out")),
        ]);
        assert!(matches!(
            state,
            SessionState::ManualFallback {
                reason: ManualReason::Decode(_)
            }
        ));
    }

    #[test]
    fn test_deadline_from_any_live_state() {
        for prefix in [
            vec![],
            vec![SessionEvent::Start],
            vec![SessionEvent::Start, SessionEvent::Prepared { candidates: 4 }],
        ] {
            let mut events = prefix;
            events.push(SessionEvent::DeadlineExpired);
            let (state, actions) = run(events);
            assert_eq!(
                state,
                SessionState::ManualFallback {
                    reason: ManualReason::Timeout
                }
            );
            assert_eq!(actions.last(), Some(&SessionAction::Finish));
        }
    }

    #[test]
    fn test_terminal_states_absorb_events() {
        let succeeded = SessionState::Succeeded { url: "u".into() };
        let (state, action) = succeeded.transition(SessionEvent::DeadlineExpired);
        assert_eq!(state, succeeded);
        assert_eq!(action, SessionAction::Ignore);

        let fallback = SessionState::ManualFallback {
            reason: ManualReason::Timeout,
        };
        let (state, action) = fallback.transition(SessionEvent::Uploaded { url: "late".into() });
        assert_eq!(state, fallback);
        assert_eq!(action, SessionAction::Ignore);
    }

    #[test]
    fn test_unexpected_event_is_error() {
        let (state, action) = SessionState::Loading.transition(SessionEvent::FrameBlack);
        assert!(matches!(state, SessionState::Error { .. }));
        assert_eq!(action, SessionAction::Finish);
    }

    #[test]
    fn test_zero_candidates_is_exhausted() {
        let (state, _) = run(vec![SessionEvent::Start, SessionEvent::Prepared { candidates: 0 }]);
        assert_eq!(
            state,
            SessionState::ManualFallback {
                reason: ManualReason::Exhausted
            }
        );
    }
}
