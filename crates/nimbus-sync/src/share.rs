//! Sharing-group files — `<group>.share` under the cloud root.
//!
//! UTF-8, line-oriented, `#` starts a comment. The first payload line is
//! the group GUID; later payload lines list member identities. The group
//! manager itself is a host collaborator; the engine only parses.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareGroup {
    pub guid: String,
    pub members: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ShareError {
    #[error("share file carries no group GUID")]
    MissingGuid,
}

/// Parse the text of a `.share` file.
pub fn parse_share_file(text: &str) -> Result<ShareGroup, ShareError> {
    let mut lines = text.lines().filter_map(|line| {
        let payload = line.split('#').next().unwrap_or("").trim();
        if payload.is_empty() {
            None
        } else {
            Some(payload.to_owned())
        }
    });

    let guid = lines.next().ok_or(ShareError::MissingGuid)?;
    Ok(ShareGroup {
        guid,
        members: lines.collect(),
    })
}
