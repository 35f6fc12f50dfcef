use crate::consistency::CheckError;
use crate::seq2seq::{Seq2SeqModel, Seq2SeqSpec};
use crate::tokenizers::{BatchEncoding, EncodeOptions, TokenizerWrapper};
use candle_core::DType;
use log::info;
use once_cell::unsync::OnceCell;

const LOG_TARGET: &str = "integration";

pub const PGE_ARTICLE: &str = " PG&E stated it scheduled the blackouts in response to forecasts for high winds amid dry conditions. The aim is to reduce the risk of wildfires. Nearly 800 thousand customers were scheduled to be affected by the shutoffs which were expected to last through at least midday tomorrow.";

pub const XSUM_ENTRY_LONGER: &str = r#" The London trio are up for best UK act and best album, as well as getting two nominations in the best song category."We got told like this morning 'Oh I think you're nominated'", said Dappy."And I was like 'Oh yeah, which one?' And now we've got nominated for four awards. I mean, wow!"Bandmate Fazer added: "We thought it's best of us to come down and mingle with everyone and say hello to the cameras. And now we find we've got four nominations."The band have two shots at the best song prize, getting the nod for their Tynchy Stryder collaboration Number One, and single Strong Again.Their album Uncle B will also go up against records by the likes of Beyonce and Kanye West.N-Dubz picked up the best newcomer Mobo in 2007, but female member Tulisa said they wouldn't be too disappointed if they didn't win this time around."At the end of the day we're grateful to be where we are in our careers."If it don't happen then it don't happen - live to fight another day and keep on making albums and hits for the fans."Dappy also revealed they could be performing live several times on the night.The group will be doing Number One and also a possible rendition of the War Child single, I Got Soul.The charity song is a  re-working of The Killers' All These Things That I've Done and is set to feature artists like Chipmunk, Ironik and Pixie Lott.This year's Mobos will be held outside of London for the first time, in Glasgow on 30 September.N-Dubz said they were looking forward to performing for their Scottish fans and boasted about their recent shows north of the border."We just done Edinburgh the other day," said Dappy."We smashed up an N-Dubz show over there. We done Aberdeen about three or four months ago - we smashed up that show over there! Everywhere we go we smash it up!" "#;

/// A reference summarization run against a published checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryCase {
    pub checkpoint: String,
    pub src_text: Vec<String>,
    pub tgt_text: Vec<String>,
    pub max_length: usize,
    pub expected_shape: (usize, usize),
    pub expected_model_max_length: usize,
}

impl SummaryCase {
    pub fn xsum() -> Self {
        Self {
            checkpoint: "google/pegasus-xsum".to_string(),
            src_text: vec![PGE_ARTICLE.to_string(), XSUM_ENTRY_LONGER.to_string()],
            tgt_text: vec![
                "California's largest electricity provider has turned off power to tens of thousands of customers.".to_string(),
                "N-Dubz have revealed they weren't expecting to get four nominations at this year's Mobo Awards.".to_string(),
            ],
            max_length: 512,
            expected_shape: (2, 421),
            expected_model_max_length: 512,
        }
    }
}

/// Runs a [`SummaryCase`], loading the tokenizer and the model at most once.
pub struct SummaryCheck {
    pub case: SummaryCase,
    spec: Seq2SeqSpec,
    tokenizer: OnceCell<TokenizerWrapper>,
    model: OnceCell<Seq2SeqModel>,
}

impl SummaryCheck {
    pub fn new(case: SummaryCase, device: Option<String>) -> Self {
        let spec = Seq2SeqSpec {
            device,
            ..Seq2SeqSpec::new(&case.checkpoint, &case.checkpoint)
        };
        Self {
            case,
            spec,
            tokenizer: OnceCell::new(),
            model: OnceCell::new(),
        }
    }

    pub fn xsum(device: Option<String>) -> Self {
        Self::new(SummaryCase::xsum(), device)
    }

    /// Uses `tokenizer` instead of fetching one, replacing any memoised one.
    pub fn with_tokenizer(self, tokenizer: TokenizerWrapper) -> Self {
        Self {
            tokenizer: OnceCell::with_value(tokenizer),
            ..self
        }
    }

    pub fn tokenizer(&self) -> anyhow::Result<&TokenizerWrapper> {
        self.tokenizer.get_or_try_init(|| {
            TokenizerWrapper::from_hub(
                &self.case.checkpoint,
                self.spec.tokenizer_file.as_deref(),
                self.spec.revision.clone(),
                self.spec.hf_token.clone(),
            )
        })
    }

    pub fn model(&self) -> anyhow::Result<&Seq2SeqModel> {
        self.model
            .get_or_try_init(|| Seq2SeqModel::load(self.spec.clone()))
    }

    /// Tokenizer ceiling and padded batch shape.
    pub fn check_inputs(&self) -> Result<BatchEncoding, CheckError> {
        let tokenizer = self.tokenizer()?;
        if tokenizer.model_max_length != self.case.expected_model_max_length {
            return Err(CheckError::mismatch(
                "tokenizer.model_max_length",
                self.case.expected_model_max_length,
                tokenizer.model_max_length,
            ));
        }

        let batch = tokenizer.encode_batch(
            &self.case.src_text,
            EncodeOptions {
                truncation: true,
                max_length: Some(self.case.max_length),
                padding: true,
            },
        )?;
        if batch.shape() != self.case.expected_shape {
            return Err(CheckError::mismatch(
                "input_ids.shape",
                self.case.expected_shape,
                batch.shape(),
            ));
        }
        Ok(batch)
    }

    pub fn compare(&self, decoded: &[String]) -> Result<(), CheckError> {
        if decoded != self.case.tgt_text.as_slice() {
            return Err(CheckError::mismatch(
                "summaries",
                self.case.tgt_text.as_slice(),
                decoded,
            ));
        }
        Ok(())
    }

    fn summarize(
        &self,
        model: &Seq2SeqModel,
        batch: &BatchEncoding,
        max_length: Option<usize>,
    ) -> Result<Vec<String>, CheckError> {
        let config = max_length.map(|n| model.generation.clone().with_max_length(n));
        let outputs = model.generate(batch, config)?;
        Ok(self.tokenizer()?.decode_batch(&outputs, true)?)
    }

    pub fn run(&self) -> Result<(), CheckError> {
        let batch = self.check_inputs()?;
        let model = self.model()?;
        info!(target: LOG_TARGET, "🤗 generating {} summaries with {}", batch.shape().0, self.case.checkpoint);
        let decoded = self.summarize(model, &batch, None)?;
        self.compare(&decoded)
    }

    /// Converts the memoized model to f16 and decodes the same batch.
    pub fn run_half_precision(
        &mut self,
        max_length: Option<usize>,
    ) -> Result<Vec<String>, CheckError> {
        let batch = self.check_inputs()?;
        self.model()?;
        if let Some(model) = self.model.get_mut() {
            model.to_dtype(DType::F16)?;
        }
        let model = self.model()?;
        self.summarize(model, &batch, max_length)
    }
}
