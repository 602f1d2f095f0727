//! HEADERS CHAIN: the headers-first sync window between the local tip
//! and the next hardcoded checkpoint (§2, §4.4).
use nakamoto_common::block::{BlockHash, Header, Height};

/// An error appending a header to the chain.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The header doesn't chain onto the current tail (I5).
    #[error("header does not connect to the chain tail")]
    Discontiguous,
    /// The header lands exactly on the next checkpoint height but with
    /// the wrong hash (I6, §4.4, §7 kind 2 "wrong checkpoint").
    #[error("header at checkpoint height does not match the checkpoint hash")]
    WrongCheckpoint,
}

/// The headers-first sync window: a contiguous run of headers appended
/// one batch of `headers` at a time, from `head` (the locally synced
/// point) towards `tip` (the next checkpoint strictly above it, I6).
#[derive(Debug, Clone)]
pub struct HeadersChain {
    head: (Height, BlockHash),
    tip: (Height, BlockHash),
    nodes: Vec<Header>,
}

impl HeadersChain {
    /// Start a fresh window from the local tip towards the given
    /// checkpoint.
    pub fn new(head: (Height, BlockHash), tip: (Height, BlockHash)) -> Self {
        debug_assert!(tip.0 > head.0, "header_tip must be strictly above header_head (I6)");
        Self {
            head,
            tip,
            nodes: Vec::new(),
        }
    }

    /// The locally-synced point this window starts from.
    pub fn head(&self) -> (Height, BlockHash) {
        self.head
    }

    /// The next checkpoint this window is working towards.
    pub fn tip(&self) -> (Height, BlockHash) {
        self.tip
    }

    /// The last appended header's height and hash, or `head` if the
    /// chain is empty.
    pub fn tail(&self) -> (Height, BlockHash) {
        match self.nodes.last() {
            Some(header) => (self.head.0 + self.nodes.len() as Height, header.block_hash()),
            None => self.head,
        }
    }

    /// Number of headers appended so far in this window.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the window has no headers appended yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All headers appended so far, from `head + 1` to the tail.
    pub fn headers(&self) -> &[Header] {
        &self.nodes
    }

    /// Append one header, checking I5 (contiguity) and I6 (checkpoint
    /// match). The caller is expected to have already verified the
    /// header's proof-of-work.
    pub fn append(&mut self, header: Header) -> Result<(), Error> {
        let (tail_height, tail_hash) = self.tail();

        if header.prev_blockhash != tail_hash {
            return Err(Error::Discontiguous);
        }
        let height = tail_height + 1;
        let hash = header.block_hash();

        if height == self.tip.0 && hash != self.tip.1 {
            return Err(Error::WrongCheckpoint);
        }
        self.nodes.push(header);
        Ok(())
    }

    /// Whether the current tail has reached (or passed) the checkpoint.
    pub fn reached_checkpoint(&self) -> bool {
        self.tail().0 >= self.tip.0
    }

    /// Re-anchor the window at a new head/tip pair, eg. after the
    /// checkpoint was crossed and import advanced the local tip, or
    /// after a loader change resets the whole window (§4.3.1 rule 2).
    pub fn reset(&mut self, head: (Height, BlockHash), tip: (Height, BlockHash)) {
        self.head = head;
        self.tip = tip;
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::block::BlockHeader;
    use bitcoin::hash_types::TxMerkleNode;
    use bitcoin::hashes::Hash;

    fn header(prev: BlockHash, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 0,
            bits: 0x1d00ffff,
            nonce,
        }
    }

    #[test]
    fn appending_contiguous_headers_advances_the_tail() {
        let genesis = BlockHash::all_zeros();
        let mut chain = HeadersChain::new((0, genesis), (2, BlockHash::all_zeros()));
        let h1 = header(genesis, 1);
        let h1_hash = h1.block_hash();

        chain.append(h1).unwrap();
        assert_eq!(chain.tail(), (1, h1_hash));

        let h2 = header(h1_hash, 2);
        chain.append(h2).unwrap();
        assert_eq!(chain.tail().0, 2);
    }

    #[test]
    fn discontiguous_header_is_rejected() {
        let genesis = BlockHash::all_zeros();
        let mut chain = HeadersChain::new((0, genesis), (5, BlockHash::all_zeros()));
        let wrong_prev = header(BlockHash::all_zeros(), 99).block_hash();
        let bad = header(wrong_prev, 1);

        assert_eq!(chain.append(bad), Err(Error::Discontiguous));
    }

    #[test]
    fn wrong_hash_at_checkpoint_height_is_rejected() {
        let genesis = BlockHash::all_zeros();
        let checkpoint = header(genesis, 123).block_hash();
        let mut chain = HeadersChain::new((0, genesis), (1, checkpoint));
        let wrong = header(genesis, 1);

        assert_eq!(chain.append(wrong), Err(Error::WrongCheckpoint));
    }
}
