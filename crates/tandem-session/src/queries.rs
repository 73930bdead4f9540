//! Storage and settings queries
//!
//! Typed pass-throughs to the worker's database layer. All of these are
//! short-lived lookups with the query timeout; the heavy lifting lives in
//! [`crate::sidecar`] and the pipeline.

use crate::sidecar::{SidecarChannel, QUERY_TIMEOUT};
use std::collections::BTreeMap;
use tandem_types::protocol::{
    SearchResultEntry, SidecarRequest, SidecarResponse, SpeakerMatchEntry, SummaryListEntry,
};
use tandem_types::{Error, Result, Settings};

impl SidecarChannel {
    pub async fn get_all_speakers(&self) -> Result<Vec<String>> {
        match self
            .request(|id| SidecarRequest::GetAllSpeakers { id }, QUERY_TIMEOUT)
            .await?
        {
            SidecarResponse::Speakers { speakers, .. } => Ok(speakers),
            other => Err(unexpected("get_all_speakers", &other)),
        }
    }

    pub async fn get_summaries_for_speaker(
        &self,
        speaker_name: String,
    ) -> Result<Vec<SummaryListEntry>> {
        match self
            .request(
                move |id| SidecarRequest::GetSummariesForSpeaker { id, speaker_name },
                QUERY_TIMEOUT,
            )
            .await?
        {
            SidecarResponse::SummaryList { summaries, .. } => Ok(summaries),
            other => Err(unexpected("get_summaries_for_speaker", &other)),
        }
    }

    pub async fn get_summary_detail(&self, summary_id: String) -> Result<serde_json::Value> {
        match self
            .request(
                move |id| SidecarRequest::GetSummaryDetail { id, summary_id },
                QUERY_TIMEOUT,
            )
            .await?
        {
            SidecarResponse::SummaryDetail { summary, .. } => Ok(summary),
            other => Err(unexpected("get_summary_detail", &other)),
        }
    }

    pub async fn search_summaries(&self, query: String) -> Result<Vec<SearchResultEntry>> {
        match self
            .request(
                move |id| SidecarRequest::SearchSummaries { id, query },
                QUERY_TIMEOUT,
            )
            .await?
        {
            SidecarResponse::SearchResults { results, .. } => Ok(results),
            other => Err(unexpected("search_summaries", &other)),
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<()> {
        let settings = serde_json::to_value(settings)?;
        match self
            .request(
                move |id| SidecarRequest::SaveSettings { id, settings },
                QUERY_TIMEOUT,
            )
            .await?
        {
            SidecarResponse::SettingsSaved { .. } => Ok(()),
            other => Err(unexpected("save_settings", &other)),
        }
    }

    /// Missing fields fall back to their defaults, so older stored settings
    /// keep loading.
    pub async fn load_settings(&self) -> Result<Settings> {
        match self
            .request(|id| SidecarRequest::LoadSettings { id }, QUERY_TIMEOUT)
            .await?
        {
            SidecarResponse::Settings { settings, .. } => Ok(serde_json::from_value(settings)?),
            other => Err(unexpected("load_settings", &other)),
        }
    }

    /// Worker-side identity matching, kept on the wire for compatibility.
    /// Session labeling matches host-side through the embedding index.
    pub async fn identify_speakers(
        &self,
        embeddings: BTreeMap<String, Vec<f32>>,
        known_embeddings: Option<BTreeMap<String, Vec<f32>>>,
    ) -> Result<BTreeMap<String, SpeakerMatchEntry>> {
        match self
            .request(
                move |id| SidecarRequest::IdentifySpeakers {
                    id,
                    embeddings,
                    known_embeddings,
                },
                QUERY_TIMEOUT,
            )
            .await?
        {
            SidecarResponse::SpeakerMatch { matches, .. } => Ok(matches),
            other => Err(unexpected("identify_speakers", &other)),
        }
    }
}

fn unexpected(kind: &'static str, resp: &SidecarResponse) -> Error {
    Error::SidecarRequestFailed {
        kind,
        message: format!("unexpected {} response", resp.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn channel_with(
        handler: impl Fn(&SidecarRequest) -> SidecarResponse + Send + 'static,
    ) -> SidecarChannel {
        let (host, worker) = duplex(64 * 1024);
        let (r, w) = tokio::io::split(host);
        let channel = SidecarChannel::connect(r, w);
        tokio::spawn(async move {
            let (r, mut w) = tokio::io::split(worker);
            let mut lines = BufReader::new(r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: SidecarRequest = serde_json::from_str(&line).unwrap();
                let out = serde_json::to_string(&handler(&req)).unwrap();
                if w.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
                let _ = w.write_all(b"\n").await;
            }
        });
        channel
    }

    #[tokio::test]
    async fn speakers_query_round_trips() {
        let channel = channel_with(|req| SidecarResponse::Speakers {
            id: Some(req.id()),
            speakers: vec!["Alice".into(), "Bob".into()],
        });
        assert_eq!(
            channel.get_all_speakers().await.unwrap(),
            vec!["Alice", "Bob"]
        );
    }

    #[tokio::test]
    async fn settings_round_trip_through_json() {
        let channel = channel_with(|req| match req {
            SidecarRequest::SaveSettings { id, .. } => {
                SidecarResponse::SettingsSaved { id: Some(*id) }
            }
            SidecarRequest::LoadSettings { id } => SidecarResponse::Settings {
                id: Some(*id),
                settings: serde_json::json!({"provider": "claude", "apiKey": "sk-x"}),
            },
            other => panic!("unexpected request: {other:?}"),
        });

        channel.save_settings(&Settings::default()).await.unwrap();
        let loaded = channel.load_settings().await.unwrap();
        assert_eq!(loaded.provider, "claude");
        assert_eq!(loaded.api_key.as_deref(), Some("sk-x"));
        // Absent fields come back as defaults.
        assert_eq!(loaded.similarity_threshold, 0.75);
    }

    #[tokio::test]
    async fn mismatched_response_kind_is_an_error() {
        let channel = channel_with(|req| SidecarResponse::Speakers {
            id: Some(req.id()),
            speakers: vec![],
        });
        let err = channel.search_summaries("roadmap".into()).await.unwrap_err();
        match err {
            Error::SidecarRequestFailed { kind, message } => {
                assert_eq!(kind, "search_summaries");
                assert!(message.contains("unexpected"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn identify_speakers_passes_through() {
        let channel = channel_with(|req| match req {
            SidecarRequest::IdentifySpeakers { id, embeddings, .. } => {
                let matches = embeddings
                    .keys()
                    .map(|label| {
                        (
                            label.clone(),
                            SpeakerMatchEntry {
                                name: Some("Alice".into()),
                                confidence: 0.9,
                            },
                        )
                    })
                    .collect();
                SidecarResponse::SpeakerMatch {
                    id: Some(*id),
                    matches,
                }
            }
            other => panic!("unexpected request: {other:?}"),
        });

        let matches = channel
            .identify_speakers(
                BTreeMap::from([("SPEAKER_00".to_string(), vec![0.1, 0.2])]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(matches["SPEAKER_00"].name.as_deref(), Some("Alice"));
    }
}
