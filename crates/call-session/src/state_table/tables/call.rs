use crate::state_table::{CallState, EventType, Guard, StateTableBuilder, Transition};

const LIVE_STATES: [CallState; 5] = [
    CallState::Idle,
    CallState::Calling,
    CallState::EarlyMedia,
    CallState::Confirmed,
    CallState::Updating,
];

const PRE_ESTABLISHED: [CallState; 2] = [CallState::Calling, CallState::EarlyMedia];

const ESTABLISHED: [CallState; 2] = [CallState::Confirmed, CallState::Updating];

/// Add all call session transitions to the table
pub fn add_call_transitions(builder: &mut StateTableBuilder) {
    // Idle: configure, then start the call
    builder
        .add_state_change(CallState::Idle, EventType::StartCall, CallState::Calling)
        .add_accept(CallState::Idle, EventType::SetSessionTimer)
        .add_accept(CallState::Idle, EventType::Set100rel)
        .add_accept(CallState::Idle, EventType::SetQos);

    // Calling -> EarlyMedia only when the provisional carries media
    builder
        .add_transition(
            CallState::Calling,
            EventType::ProvisionalResponse,
            Transition::to(CallState::EarlyMedia).guarded(Guard::HasEarlyMedia),
        )
        .add_accept(CallState::EarlyMedia, EventType::ProvisionalResponse);

    // 2xx to the INVITE: negotiate the answer; NoCommonMedia tears down
    builder.add_for_states(
        &PRE_ESTABLISHED,
        EventType::SuccessResponse,
        Transition::to(CallState::Confirmed)
            .guarded(Guard::AnswersPendingInvite)
            .on_failure(CallState::Terminated),
    );

    // Rejection before establishment ends the call
    builder.add_for_states(&PRE_ESTABLISHED, EventType::FailureResponse, Transition::to(CallState::Terminated));

    // Confirmed: mid-call intents enter Updating; a failed negotiation returns to Confirmed
    for intent in [EventType::Hold, EventType::Resume, EventType::AddVideo, EventType::SetSessionTimer] {
        builder.add_transition(
            CallState::Confirmed,
            intent,
            Transition::to(CallState::Updating).on_failure(CallState::Confirmed),
        );
    }
    builder
        .add_accept(CallState::Confirmed, EventType::SendDtmf)
        .add_accept(CallState::Confirmed, EventType::Set100rel)
        .add_accept(CallState::Confirmed, EventType::SetQos)
        .add_accept(CallState::Confirmed, EventType::RemoteOffer)
        // 2xx/non-2xx to our session refresh UPDATE, or a 2xx retransmission
        .add_accept(CallState::Confirmed, EventType::SuccessResponse)
        .add_transition(
            CallState::Confirmed,
            EventType::FailureResponse,
            Transition::stay().on_failure(CallState::Terminated),
        );

    // Updating: the re-INVITE answer commits or reverts atomically
    builder
        .add_transition(
            CallState::Updating,
            EventType::SuccessResponse,
            Transition::to(CallState::Confirmed).guarded(Guard::AnswersPendingInvite),
        )
        .add_transition(
            CallState::Updating,
            EventType::FailureResponse,
            Transition::to(CallState::Confirmed)
                .guarded(Guard::AnswersPendingInvite)
                .on_failure(CallState::Terminated),
        )
        // glare: answered with 491, pending update untouched
        .add_accept(CallState::Updating, EventType::RemoteOffer)
        .add_accept(CallState::Updating, EventType::ProvisionalResponse);

    // Established sessions: timers, DTMF reports, remote BYE, media failure
    builder
        .add_for_states(&ESTABLISHED, EventType::TimerDue, Transition::stay())
        .add_for_states(
            &ESTABLISHED,
            EventType::TimerExpired,
            Transition::to(CallState::Terminated),
        )
        .add_for_states(&ESTABLISHED, EventType::DtmfResult, Transition::stay())
        .add_for_states(&ESTABLISHED, EventType::RemoteBye, Transition::to(CallState::Terminated))
        .add_for_states(&ESTABLISHED, EventType::MediaFailure, Transition::to(CallState::Terminated));

    // Early media can fail too
    builder.add_state_change(CallState::EarlyMedia, EventType::MediaFailure, CallState::Terminated);

    // Any live state with a dialog in progress: transport failure is fatal
    for state in [CallState::Calling, CallState::EarlyMedia, CallState::Confirmed, CallState::Updating] {
        builder.add_state_change(state, EventType::TransportFailure, CallState::Terminated);
    }

    // terminate() is valid from every non-terminated state
    builder.add_for_states(&LIVE_STATES, EventType::Terminate, Transition::to(CallState::Terminated));
}
