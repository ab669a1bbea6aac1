use pulldown_cmark::{html, Options, Parser};

/// 将Markdown渲染为HTML，代码块带上 hljs 样式类
pub fn render(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options.insert(Options::ENABLE_HEADING_ATTRIBUTES);

    let parser = Parser::new_ext(markdown, options);
    let mut html_output = String::new();
    html::push_html(&mut html_output, parser);

    // 已有语言类时合并进同一个 class 属性
    html_output
        .replace("<pre><code class=\"", "<pre><code class=\"hljs ")
        .replace("<pre><code>", "<pre><code class=\"hljs\">")
}
