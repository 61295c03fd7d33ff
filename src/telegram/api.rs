// Best-effort Bot API calls.
//
// Moderation side effects (delete, restrict, notices) must never abort the
// handler, so failures are logged and swallowed here.

use teloxide::requests::{HasPayload, Payload, Request};

/// Send a request, logging and discarding any error.
pub async fn api_log<R>(method: &str, req: R) -> Option<<R::Payload as Payload>::Output>
where
    R: Request + HasPayload,
{
    match req.send().await {
        Ok(output) => Some(output),
        Err(e) => {
            tracing::warn!(method, error = %e, hint = permission_hint(method), "Bot API call failed");
            None
        }
    }
}

fn permission_hint(method: &str) -> &'static str {
    match method {
        "delete_message" => "bot needs the Delete messages admin right",
        "restrict_chat_member" => "bot needs the Ban users admin right and the target must not be an admin",
        "ban_chat_member" | "unban_chat_member" => "bot needs the Ban users admin right",
        "send_message" => "bot may have been removed from the chat",
        "pin_chat_message" | "unpin_chat_message" => "bot needs the Pin messages admin right",
        "approve_chat_join_request" | "decline_chat_join_request" => {
            "bot needs the Invite users admin right, or the request was already handled"
        }
        _ => "network or request error",
    }
}
