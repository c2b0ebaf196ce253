use url::Url;
use urlencoding::encode;

use crate::protocol::ProgramId;

/// A shareable link to a watch party
#[derive(Debug, Clone, PartialEq)]
pub struct InviteLink {
    pub room_id: String,
    pub program: Option<ProgramId>,
}

pub fn build_invite_url(room_id: &str, program: Option<&ProgramId>) -> String {
    let mut params = vec![format!("room={}", encode(room_id))];
    if let Some(program) = program.filter(|p| !p.as_str().is_empty()) {
        params.push(format!("program={}", encode(program.as_str())));
    }
    let query = params.join("&");
    format!("party://join?{}", query)
}

pub fn parse_invite_url(input: &str) -> Option<InviteLink> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = if trimmed.starts_with("party://")
        || trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
    {
        trimmed.to_string()
    } else {
        format!("party://join?{}", trimmed.trim_start_matches('?'))
    };

    let url = Url::parse(&normalized).ok()?;
    let mut room_id = None;
    let mut program = None;

    for (key, value) in url.query_pairs() {
        let value = value.into_owned();
        match key.as_ref() {
            "room" => room_id = Some(value),
            "program" => program = Some(ProgramId::new(value)),
            _ => {}
        }
    }

    let room_id = room_id.filter(|id| !id.trim().is_empty())?;
    Some(InviteLink {
        room_id,
        program: program.filter(|p| !p.as_str().is_empty()),
    })
}
