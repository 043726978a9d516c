//! 字段与词汇表
//!
//! `Field` 描述一个文本字段（源语言或目标语言）：填充 ID 和词表大小。
//! 嵌入层工厂只依赖这两项。

use std::collections::HashMap;

pub const PAD_TOKEN: &str = "<pad>";
pub const UNK_TOKEN: &str = "<unk>";
pub const BOS_TOKEN: &str = "<bos>";
pub const EOS_TOKEN: &str = "<eos>";

/// 字段配置
pub trait Field {
    /// 填充 token 的 ID
    fn pad_id(&self) -> usize;

    /// 词表大小
    fn vocab_len(&self) -> usize;
}

/// 简单的词汇表
#[derive(Debug, Clone)]
pub struct Vocabulary {
    /// token 到 ID 的映射
    token_to_id: HashMap<String, usize>,
    /// ID 到 token 的映射
    id_to_token: Vec<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    /// 创建只含特殊标记的词汇表
    ///
    /// `<pad>` = 0, `<unk>` = 1, `<bos>` = 2, `<eos>` = 3
    pub fn new() -> Self {
        let mut vocab = Self {
            token_to_id: HashMap::new(),
            id_to_token: Vec::new(),
        };
        for token in [PAD_TOKEN, UNK_TOKEN, BOS_TOKEN, EOS_TOKEN] {
            vocab.push(token);
        }
        vocab
    }

    fn push(&mut self, token: &str) {
        if !self.token_to_id.contains_key(token) {
            self.token_to_id.insert(token.to_string(), self.id_to_token.len());
            self.id_to_token.push(token.to_string());
        }
    }

    /// 从文本列表构建词汇表
    ///
    /// 词频不低于 `min_freq` 的词按频率降序加入，同频按字典序。
    pub fn from_texts<S: AsRef<str>>(texts: &[S], min_freq: usize) -> Self {
        let mut vocab = Self::new();

        // 统计词频
        let mut freq: HashMap<&str, usize> = HashMap::new();
        for text in texts {
            for token in text.as_ref().split_whitespace() {
                *freq.entry(token).or_insert(0) += 1;
            }
        }

        let mut words: Vec<_> = freq
            .into_iter()
            .filter(|&(_, count)| count >= min_freq)
            .collect();
        words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        for (word, _) in words {
            vocab.push(word);
        }

        tracing::info!(vocab_size = vocab.len(), "Vocabulary built");
        vocab
    }

    pub fn token_id(&self, token: &str) -> Option<usize> {
        self.token_to_id.get(token).copied()
    }

    pub fn unk_id(&self) -> usize {
        self.token_to_id[UNK_TOKEN]
    }

    pub fn bos_id(&self) -> usize {
        self.token_to_id[BOS_TOKEN]
    }

    pub fn eos_id(&self) -> usize {
        self.token_to_id[EOS_TOKEN]
    }

    /// 将文本转换为 token IDs，截断或填充到 `max_len`
    pub fn encode(&self, text: &str, max_len: usize) -> Vec<usize> {
        let mut tokens: Vec<usize> = text
            .split_whitespace()
            .map(|token| self.token_id(token).unwrap_or_else(|| self.unk_id()))
            .take(max_len)
            .collect();

        tokens.resize(max_len, self.pad_id());
        tokens
    }

    /// 将 token IDs 转换回文本（跳过填充）
    pub fn decode(&self, tokens: &[usize]) -> String {
        tokens
            .iter()
            .filter(|&&id| id != self.pad_id())
            .filter_map(|&id| self.id_to_token.get(id).map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }
}

impl Field for Vocabulary {
    fn pad_id(&self) -> usize {
        self.token_to_id[PAD_TOKEN]
    }

    fn vocab_len(&self) -> usize {
        self.len()
    }
}
