//! Word lists and compiled patterns behind entity and keyword extraction
//!
//! Every list has a built-in default and can be replaced from a TOML file
//! named by `[lexicon] file`. Lists missing from the file keep their defaults.

use crate::error::{Result, StratumError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Prior-knowledge decomposition rule as written in the lexicon file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorRuleConfig {
    pub pattern: String,
    pub strategy: String,
    #[serde(default)]
    pub sub_queries: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Lexicon file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LexiconFile {
    /// Single-character surnames, as one string
    pub surnames: String,
    pub honorifics: Vec<String>,
    pub role_markers: Vec<String>,
    pub organization_suffixes: Vec<String>,
    pub location_suffixes: Vec<String>,
    pub known_places: Vec<String>,
    pub relative_times: Vec<String>,
    pub topic_words: Vec<String>,
    pub domain_nouns: Vec<String>,
    pub domain_verbs: Vec<String>,
    pub stop_words: Vec<String>,
    pub invalid_names: Vec<String>,
    pub leading_noise: Vec<String>,
    pub complaint_words: Vec<String>,
    pub content_words: Vec<String>,
    pub handling_words: Vec<String>,
    pub event_words: Vec<String>,
    pub action_words: Vec<String>,
    pub object_words: Vec<String>,
    pub intent_keywords: HashMap<String, Vec<String>>,
    pub intent_expansions: HashMap<String, Vec<String>>,
    pub prior_rules: Vec<PriorRuleConfig>,
    pub synonyms: HashMap<String, Vec<String>>,
}

fn words(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for LexiconFile {
    fn default() -> Self {
        let mut intent_keywords = HashMap::new();
        intent_keywords.insert(
            "complaint_content".to_string(),
            words(&["投诉", "内容", "反映", "举报", "申诉"]),
        );
        intent_keywords.insert(
            "complaint_handling".to_string(),
            words(&["处理", "办理", "解决", "回复", "答复"]),
        );
        intent_keywords.insert(
            "person_related".to_string(),
            words(&["姓名", "联系", "电话", "地址", "身份"]),
        );
        intent_keywords.insert(
            "event_related".to_string(),
            words(&["事件", "情况", "经过", "详情", "过程"]),
        );

        let mut intent_expansions = HashMap::new();
        intent_expansions.insert(
            "complaint_content".to_string(),
            words(&["投诉详情", "反映内容", "举报事项", "申诉原因"]),
        );
        intent_expansions.insert(
            "complaint_handling".to_string(),
            words(&["处理结果", "回复情况", "解决方案", "调查结论"]),
        );
        intent_expansions.insert(
            "person_related".to_string(),
            words(&["相关人员", "当事人", "责任人"]),
        );

        let mut synonyms = HashMap::new();
        synonyms.insert("投诉".to_string(), words(&["举报", "反映", "申诉"]));
        synonyms.insert("处理".to_string(), words(&["处置", "办理", "解决"]));
        synonyms.insert("问题".to_string(), words(&["情况", "事项"]));
        synonyms.insert("事件".to_string(), words(&["事故", "案件"]));
        synonyms.insert("回复".to_string(), words(&["答复", "反馈"]));

        let rule = |pattern: &str, strategy: &str, sub_queries: &[&str], keywords: &[&str]| {
            PriorRuleConfig {
                pattern: pattern.to_string(),
                strategy: strategy.to_string(),
                sub_queries: words(sub_queries),
                keywords: words(keywords),
            }
        };

        Self {
            surnames: "王李张刘陈杨黄赵周吴徐孙朱马胡郭林何高梁郑罗宋谢唐韩曹许邓萧冯曾程蔡彭潘袁\
                       于董余苏叶吕魏蒋田杜丁沈姜范江傅钟卢汪戴崔任陆廖姚方金邱夏谭韦贾邹石熊孟秦\
                       阎薛侯雷白龙段郝孔邵史毛常万顾赖武康贺严尹钱施牛洪龚汤陶黎温莫易樊乔文安殷\
                       颜庄章鲁倪庞邢俞翟蓝聂丛岳齐"
                .to_string(),
            honorifics: words(&[
                "先生", "女士", "同志", "老师", "医生", "护士", "主任", "经理", "总监", "专家",
                "局长", "处长", "科长", "主管", "师傅", "阿姨", "大爷",
            ]),
            role_markers: words(&["投诉人", "举报人", "申诉人", "反映人"]),
            organization_suffixes: words(&[
                "有限公司", "公司", "集团", "医院", "学校", "大学", "银行", "委员会", "中心",
                "协会", "研究院", "政府", "部门", "管理局", "局", "派出所",
            ]),
            location_suffixes: words(&[
                "省", "市", "区", "县", "镇", "乡", "村", "街道", "路", "小区", "社区", "广场",
            ]),
            known_places: words(&[
                "北京", "上海", "天津", "重庆", "广州", "深圳", "杭州", "南京", "成都", "武汉",
                "西安", "苏州", "长沙", "郑州", "青岛",
            ]),
            relative_times: words(&[
                "今天", "昨天", "前天", "明天", "本周", "上周", "下周", "本月", "上月", "上个月",
                "今年", "去年", "前年", "近期", "最近",
            ]),
            topic_words: words(&[
                "投诉", "举报", "反映", "申诉", "意见", "建议", "问题", "事件", "情况", "处理",
                "调查", "检查",
            ]),
            domain_nouns: words(&[
                "投诉", "举报", "反映", "申诉", "内容", "情况", "事件", "问题", "意见", "建议",
                "详情", "结果", "规定", "案件", "舆情", "事故", "隐患", "安全", "质量", "服务",
                "物业", "噪音", "环境", "食品", "价格", "退款", "合同", "记录", "信息", "电话",
                "地址", "姓名", "身份", "原因", "经过", "过程", "措施", "通报", "通知", "要求",
                "企业", "商家", "消费者", "业主", "居民", "工作", "类别",
            ]),
            domain_verbs: words(&[
                "处理", "调查", "检查", "处置", "应对", "解决", "回复", "答复", "办理", "发生",
                "整改", "核实", "反馈", "受理", "联系",
            ]),
            stop_words: words(&[
                "的", "了", "是", "在", "和", "与", "及", "或", "对", "把", "被", "给", "也", "都",
                "就", "还", "又", "吗", "呢", "吧", "啊", "有", "我", "你", "他", "她", "它", "们",
                "这", "那", "个", "什么", "怎么", "如何", "哪些", "多少", "为什么", "是否", "关于",
                "有关", "相关", "一下", "请问", "the", "a", "an", "of", "and", "or", "to", "in",
                "is", "for", "on",
            ]),
            invalid_names: words(&[
                "投诉", "处理", "情况", "内容", "什么", "如何", "为什么", "怎么", "哪里", "问题",
                "事件", "反映", "举报", "申诉", "有关", "关于", "相关", "所有", "记录", "详细",
                "信息", "先生", "女士", "同志", "老师", "医生", "护士", "主任", "经理",
            ]),
            leading_noise: words(&[
                "关于", "有关", "对于", "投诉", "举报", "反映", "申诉", "在", "对", "向", "到", "从",
                "的",
            ]),
            complaint_words: words(&["投诉", "举报", "反映", "申诉"]),
            content_words: words(&["内容", "什么", "详情"]),
            handling_words: words(&["处理", "结果", "回复"]),
            event_words: words(&["事件", "情况"]),
            action_words: words(&["处理", "调查", "检查", "处置", "应对", "解决"]),
            object_words: words(&["投诉", "事件", "问题", "情况", "案件", "舆情"]),
            intent_keywords,
            intent_expansions,
            prior_rules: vec![
                rule(
                    r"关于.+的(处理|处置)",
                    "process_oriented",
                    &["{topic}处理情况", "{topic}处置措施", "{topic}处理结果"],
                    &["处理", "处置"],
                ),
                rule(
                    r"(为什么|原因|导致)",
                    "cause_analysis",
                    &["{topic}原因", "{topic}经过", "{topic}事件"],
                    &["原因", "事件", "经过"],
                ),
                rule(
                    r"(安全|隐患|事故)",
                    "safety_domain",
                    &["{topic}安全隐患", "{topic}事故", "{topic}安全检查"],
                    &["安全", "隐患", "事故"],
                ),
                rule(
                    r"(舆情|危机|应急)",
                    "crisis_management",
                    &["{topic}舆情", "{topic}应急处置", "{topic}应对措施"],
                    &["舆情", "应急", "危机"],
                ),
                rule(
                    r"(详细|具体).*(内容|情况)",
                    "topic_detail",
                    &["{topic}详细内容", "{topic}具体情况"],
                    &["内容", "情况"],
                ),
            ],
            synonyms,
        }
    }
}

/// Compiled prior-knowledge rule
#[derive(Debug, Clone)]
pub struct PriorRule {
    pub regex: Regex,
    pub strategy: String,
    pub sub_queries: Vec<String>,
    pub keywords: Vec<String>,
}

/// Part-of-speech style tags carried by tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pos {
    /// Person name
    Nr,
    /// Organisation
    Nt,
    /// Location
    Ns,
    /// Time expression
    T,
    /// Domain noun
    N,
    /// Domain verb
    V,
    /// ASCII word
    Eng,
    /// Numeral
    M,
    /// Anything else
    X,
}

impl Pos {
    pub fn tag(&self) -> &'static str {
        match self {
            Pos::Nr => "nr",
            Pos::Nt => "nt",
            Pos::Ns => "ns",
            Pos::T => "t",
            Pos::N => "n",
            Pos::V => "v",
            Pos::Eng => "eng",
            Pos::M => "m",
            Pos::X => "x",
        }
    }

    /// Weight prior applied on top of term frequency
    pub fn prior(&self) -> f32 {
        match self {
            Pos::Nr | Pos::Nt | Pos::Ns | Pos::T => 3.0,
            Pos::N => 2.0,
            Pos::V => 1.5,
            Pos::Eng => 1.2,
            Pos::M | Pos::X => 1.0,
        }
    }

    pub fn is_entity(&self) -> bool {
        matches!(self, Pos::Nr | Pos::Nt | Pos::Ns | Pos::T)
    }
}

/// Compiled lexicon shared by the extractor, tokenizer and decomposer
#[derive(Debug, Clone)]
pub struct Lexicon {
    pub words: LexiconFile,
    /// Surname + up to 3 Han + honorific
    pub surname_name: Regex,
    /// 2-4 Han + honorific
    pub titled_name: Regex,
    /// Role marker + optional colon + 2-4 Han
    pub role_name: Regex,
    pub organization: Regex,
    pub location: Regex,
    pub absolute_time: Regex,
    pub prior_rules: Vec<PriorRule>,
    /// Dictionary for forward maximum matching
    pub dictionary: HashMap<String, Pos>,
    pub max_word_chars: usize,
}

impl Lexicon {
    /// Lexicon with the built-in word lists
    pub fn builtin() -> Result<Self> {
        Self::compile(LexiconFile::default())
    }

    /// Load a lexicon file, falling back to built-ins for absent lists
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| StratumError::Io {
            source: e,
            context: format!("Failed to read lexicon file: {:?}", path),
        })?;
        let file: LexiconFile = toml::from_str(&content)?;
        Self::compile(file)
    }

    /// Resolve from configuration: the named file when set, else built-ins
    pub fn from_config(config: &crate::config::LexiconConfig) -> Result<Self> {
        match &config.file {
            Some(path) => Self::from_file(path),
            None => Self::builtin(),
        }
    }

    pub fn compile(words: LexiconFile) -> Result<Self> {
        let alternation = |items: &[String]| {
            let mut sorted: Vec<&String> = items.iter().filter(|s| !s.is_empty()).collect();
            // Longest first so "有限公司" wins over "公司"
            sorted.sort_by_key(|s| std::cmp::Reverse(s.chars().count()));
            sorted
                .iter()
                .map(|s| regex::escape(s))
                .collect::<Vec<_>>()
                .join("|")
        };

        let compile = |name: &str, pattern: String| {
            Regex::new(&pattern)
                .map_err(|e| StratumError::Config(format!("Invalid {} pattern: {}", name, e)))
        };

        let honorifics = alternation(&words.honorifics);
        let surnames = regex::escape(&words.surnames);

        let surname_name = compile(
            "surname name",
            format!(r"[{}]\p{{Han}}{{0,3}}?(?:{})", surnames, honorifics),
        )?;
        let titled_name = compile(
            "titled name",
            format!(r"\p{{Han}}{{2,4}}?(?:{})", honorifics),
        )?;
        let role_name = compile(
            "role name",
            format!(
                r"(?:{})[:：]?\s*(\p{{Han}}{{2,4}})",
                alternation(&words.role_markers)
            ),
        )?;
        let organization = compile(
            "organization",
            format!(
                r"\p{{Han}}{{1,12}}?(?:{})",
                alternation(&words.organization_suffixes)
            ),
        )?;
        let location = compile(
            "location",
            format!(
                r"\p{{Han}}{{1,8}}?(?:{})|(?:{})",
                alternation(&words.location_suffixes),
                alternation(&words.known_places)
            ),
        )?;
        let absolute_time = compile(
            "time",
            r"\d{4}年(?:\d{1,2}月)?(?:\d{1,2}日)?|\d{1,2}月\d{1,2}日|\d{4}-\d{1,2}-\d{1,2}"
                .to_string(),
        )?;

        let prior_rules = words
            .prior_rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|regex| PriorRule {
                        regex,
                        strategy: rule.strategy.clone(),
                        sub_queries: rule.sub_queries.clone(),
                        keywords: rule.keywords.clone(),
                    })
                    .map_err(|e| {
                        StratumError::Config(format!(
                            "Invalid prior rule pattern '{}': {}",
                            rule.pattern, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut dictionary = HashMap::new();
        for word in words.domain_nouns.iter().chain(words.topic_words.iter()) {
            dictionary.insert(word.clone(), Pos::N);
        }
        // Words on both lists are tagged as verbs
        for word in &words.domain_verbs {
            dictionary.insert(word.clone(), Pos::V);
        }
        for word in &words.known_places {
            dictionary.insert(word.clone(), Pos::Ns);
        }
        for word in &words.relative_times {
            dictionary.insert(word.clone(), Pos::T);
        }
        for word in &words.stop_words {
            dictionary.entry(word.clone()).or_insert(Pos::X);
        }
        let max_word_chars = dictionary
            .keys()
            .map(|w| w.chars().count())
            .max()
            .unwrap_or(1);

        Ok(Self {
            words,
            surname_name,
            titled_name,
            role_name,
            organization,
            location,
            absolute_time,
            prior_rules,
            dictionary,
            max_word_chars,
        })
    }

    pub fn is_stop_word(&self, word: &str) -> bool {
        self.words.stop_words.iter().any(|w| w == word)
    }

    pub fn is_honorific(&self, word: &str) -> bool {
        self.words.honorifics.iter().any(|w| w == word)
    }

    /// First prior rule whose pattern matches `query`
    pub fn match_prior_rule(&self, query: &str) -> Option<&PriorRule> {
        self.prior_rules.iter().find(|rule| rule.regex.is_match(query))
    }

    pub fn synonyms_of(&self, word: &str) -> &[String] {
        self.words
            .synonyms
            .get(word)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
