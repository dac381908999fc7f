//! Static template catalog.
//!
//! Templates are an opaque lookup from the pipeline's point of view: id in,
//! prompt and card type out. The catalog ships compiled in.

use crate::types::{CardType, Language};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Template {
    pub id: &'static str,
    pub name: &'static str,
    pub name_en: &'static str,
    pub card_type: CardType,
    #[serde(skip)]
    pub prompt_zh: &'static str,
    #[serde(skip)]
    pub prompt_en: &'static str,
}

impl Template {
    /// Prompt for the requested language, falling back to the other when a
    /// translation is missing.
    pub fn prompt(&self, language: Language) -> &'static str {
        match language {
            Language::Zh if !self.prompt_zh.is_empty() => self.prompt_zh,
            Language::En if !self.prompt_en.is_empty() => self.prompt_en,
            _ if !self.prompt_zh.is_empty() => self.prompt_zh,
            _ => self.prompt_en,
        }
    }
}

pub static TEMPLATES: &[Template] = &[
    Template {
        id: "minimalist-cover",
        name: "极简主义封面",
        name_en: "Minimalist Cover",
        card_type: CardType::Cover,
        prompt_zh: "你是一位数字杂志艺术总监。请根据用户提供的主题，生成一个极简主义风格的封面，\
                    使用大量留白和2-3种中性色。输出一个完整的 SVG 文档，宽 800 高 600，\
                    不要输出任何解释文字。",
        prompt_en: "You are a digital magazine art director. Produce a minimalist cover for the \
                    given topic using generous whitespace and two to three neutral colors. \
                    Output one complete SVG document, 800 by 600, with no prose around it.",
    },
    Template {
        id: "geometric-cover",
        name: "几何构成封面",
        name_en: "Geometric Cover",
        card_type: CardType::Cover,
        prompt_zh: "请以构成主义风格设计封面：纯色几何色块、强对比、网格排版。\
                    输出一个完整的 SVG 文档，宽 800 高 600，不要附加说明。",
        prompt_en: "Design a constructivist cover: flat geometric shapes, strong contrast, \
                    grid layout. Output one complete 800x600 SVG document and nothing else.",
    },
    Template {
        id: "elegant-text-card",
        name: "优雅文字卡",
        name_en: "Elegant Text Card",
        card_type: CardType::Card,
        prompt_zh: "请将用户的文字整理为一张优雅的知识卡片：提炼核心要点，衬线字体，\
                    宽度 400px。输出一个自包含的 HTML 片段（单个 <div> 根元素，内联样式），\
                    不要输出除代码以外的内容。",
        prompt_en: "Turn the text into an elegant knowledge card: distilled key points, serif \
                    type, 400px wide. Output a self-contained HTML fragment (a single <div> \
                    root with inline styles) and nothing but the code.",
    },
    Template {
        id: "bold-text-card",
        name: "大胆现代文字卡",
        name_en: "Bold Modern Text Card",
        card_type: CardType::Card,
        prompt_zh: "请用大胆现代的风格排版这段文字：超大字号标题、强烈对比色。\
                    输出单个 <div> 根元素的 HTML 片段，内联样式，宽度 400px。",
        prompt_en: "Typeset the text in a bold modern style: oversized headline, high-contrast \
                    palette. Output one HTML fragment rooted at a single <div>, inline styles, \
                    400px wide.",
    },
    Template {
        id: "flow-diagram",
        name: "流程逻辑图",
        name_en: "Flow Diagram",
        card_type: CardType::Diagram,
        prompt_zh: "请将用户描述的逻辑整理为流程图：节点用圆角矩形，箭头表示流向。\
                    输出一个完整的 SVG 文档，宽 800 高 600，不要附加解释。",
        prompt_en: "Lay the described logic out as a flow diagram: rounded-rectangle nodes, \
                    arrows for direction. Output one complete 800x600 SVG document only.",
    },
    Template {
        id: "mindmap-diagram",
        name: "思维导图",
        name_en: "Mind Map",
        card_type: CardType::Diagram,
        prompt_zh: "请将内容整理为思维导图：中心主题向外辐射分支。\
                    输出一个完整的 SVG 文档，宽 800 高 600，不要输出其他文字。",
        prompt_en: "Organize the content as a mind map radiating from a central topic. \
                    Output one complete 800x600 SVG document and no other text.",
    },
];

pub fn template_by_id(id: &str) -> Option<&'static Template> {
    TEMPLATES.iter().find(|t| t.id == id)
}

pub fn templates_by_type(card_type: CardType) -> Vec<&'static Template> {
    TEMPLATES.iter().filter(|t| t.card_type == card_type).collect()
}
