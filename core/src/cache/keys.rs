use batcher_config::Strategy;
use bitcoin::Txid;

/// Typed storage keys. Every key is `[strategy tag][entity tag][content]`,
/// so a prefix without content scans one entity of one strategy.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CacheKey<'a> {
    PendingBatch(Option<&'a Txid>),
    FinalizedBatch(Option<&'a Txid>),
    PendingRequest(Option<&'a str>),
    FinalizedRequest(Option<&'a str>),
    /// Request id to the txid of the batch that settles it.
    RequestIndex(Option<&'a str>),
    LatestBatch,
}

impl CacheKey<'_> {
    fn entity_tag(&self) -> u8 {
        match self {
            CacheKey::PendingBatch(_) => b'b',
            CacheKey::FinalizedBatch(_) => b'B',
            CacheKey::PendingRequest(_) => b'r',
            CacheKey::FinalizedRequest(_) => b'R',
            CacheKey::RequestIndex(_) => b'i',
            CacheKey::LatestBatch => b'l',
        }
    }

    pub fn as_prefix(&self, strategy: Strategy) -> Vec<u8> {
        vec![strategy.tag(), self.entity_tag()]
    }

    fn serialize_content(&self) -> Vec<u8> {
        match self {
            CacheKey::PendingBatch(Some(txid)) | CacheKey::FinalizedBatch(Some(txid)) => {
                txid.to_string().into_bytes()
            }
            CacheKey::PendingRequest(Some(id))
            | CacheKey::FinalizedRequest(Some(id))
            | CacheKey::RequestIndex(Some(id)) => id.as_bytes().to_vec(),
            _ => vec![],
        }
    }

    pub fn as_key(&self, strategy: Strategy) -> Vec<u8> {
        let mut v = self.as_prefix(strategy);
        v.extend_from_slice(&self.serialize_content());

        v
    }
}
