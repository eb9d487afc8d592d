// Parser for Streamlet .str source files.
//
// Parses a token stream (from the lexer) into an AST. Uses chumsky
// combinators; expression precedence follows C.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics; parsing continues.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Option<Program>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a Streamlet source string. Lexes then parses.
///
/// Returns an AST (if parsing succeeded) plus any errors.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    // Convert lexer output to chumsky stream.
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = program_parser(source);
    let (program, parse_errors) = parser.parse(stream).into_output_errors();

    // Merge lex errors + parse errors.
    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        program,
        errors: all_errors,
    }
}

// ── Main parser builder ──
//
// All grammar rules are built inside `program_parser` so that the `source`
// reference is captured once and shared by all combinators. This avoids
// complex lifetime annotations on per-rule helper functions.

fn program_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Program, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Identifier ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    // Forward declarations for the mutually recursive rules: expressions
    // reference type specifiers (casts), type specifiers reference
    // expressions (array sizes), statements reference both.
    let mut assign_expr = Recursive::declare();
    let mut expr = Recursive::declare();
    let mut stmt = Recursive::declare();

    // ── Type specifiers ──
    //
    // base: void | boolean | bit | float | complex | int ('<' expr '>')? | NAME
    // suffix: '[' expr ']' (repeatable; left-to-right nesting)

    let base_type = choice((
        just(Token::Void).map_with(|_, e| TypeSpec {
            kind: TypeSpecKind::Void,
            span: e.span(),
        }),
        just(Token::Boolean).map_with(|_, e| TypeSpec {
            kind: TypeSpecKind::Boolean,
            span: e.span(),
        }),
        just(Token::Bit).map_with(|_, e| TypeSpec {
            kind: TypeSpecKind::Bit,
            span: e.span(),
        }),
        just(Token::Float).map_with(|_, e| TypeSpec {
            kind: TypeSpecKind::Float,
            span: e.span(),
        }),
        just(Token::Complex).map_with(|_, e| TypeSpec {
            kind: TypeSpecKind::Complex,
            span: e.span(),
        }),
        just(Token::Int)
            .ignore_then(
                assign_expr
                    .clone()
                    .delimited_by(just(Token::Lt), just(Token::Gt))
                    .or_not(),
            )
            .map_with(|width, e| TypeSpec {
                kind: match width {
                    Some(w) => TypeSpecKind::ApInt(Box::new(w)),
                    None => TypeSpecKind::Int,
                },
                span: e.span(),
            }),
        ident.clone().map(|id| TypeSpec {
            kind: TypeSpecKind::Named(id.name.clone()),
            span: id.span,
        }),
    ));

    let type_spec = base_type
        .clone()
        .foldl_with(
            assign_expr
                .clone()
                .delimited_by(just(Token::LBracket), just(Token::RBracket))
                .repeated(),
            |elem, len, e| TypeSpec {
                kind: TypeSpecKind::Array {
                    elem: Box::new(elem),
                    len: Box::new(len),
                },
                span: e.span(),
            },
        )
        .boxed();

    // ── Primary expressions ──

    let literal = select! {
        Token::IntLit(v) => ExprKind::IntLit(v),
        Token::FloatLit(v) => ExprKind::FloatLit(v),
        Token::True => ExprKind::BoolLit(true),
        Token::False => ExprKind::BoolLit(false),
    }
    .map_with(|kind, e| Expr {
        kind,
        span: e.span(),
    });

    let call = ident
        .clone()
        .then(
            assign_expr
                .clone()
                .separated_by(just(Token::Comma))
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map_with(|(name, args), e| Expr {
            kind: ExprKind::Call { name, args },
            span: e.span(),
        });

    let peek_expr = just(Token::Peek)
        .ignore_then(
            assign_expr
                .clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .map_with(|idx, e| Expr {
            kind: ExprKind::Peek(Box::new(idx)),
            span: e.span(),
        });

    let pop_expr = just(Token::Pop)
        .then(just(Token::LParen))
        .then(just(Token::RParen))
        .map_with(|_, e| Expr {
            kind: ExprKind::Pop,
            span: e.span(),
        });

    let ident_expr = ident.clone().map(|id| Expr {
        kind: ExprKind::Ident(id.name),
        span: id.span,
    });

    let paren_expr = expr
        .clone()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let primary = choice((
        literal,
        peek_expr,
        pop_expr,
        call,
        ident_expr,
        paren_expr,
    ))
    .boxed();

    // ── Postfix: indexing, post-increment/decrement ──

    #[derive(Clone)]
    enum Postfix {
        Index(Expr),
        Inc,
        Dec,
    }

    let postfix_op = choice((
        assign_expr
            .clone()
            .delimited_by(just(Token::LBracket), just(Token::RBracket))
            .map(Postfix::Index),
        just(Token::PlusPlus).to(Postfix::Inc),
        just(Token::MinusMinus).to(Postfix::Dec),
    ));

    let postfix = primary
        .foldl_with(postfix_op.repeated(), |base, op, e| {
            let kind = match op {
                Postfix::Index(index) => ExprKind::Index {
                    base: Box::new(base),
                    index: Box::new(index),
                },
                Postfix::Inc => ExprKind::Unary {
                    op: UnaryOp::PostIncrement,
                    operand: Box::new(base),
                },
                Postfix::Dec => ExprKind::Unary {
                    op: UnaryOp::PostDecrement,
                    operand: Box::new(base),
                },
            };
            Expr {
                kind,
                span: e.span(),
            }
        })
        .boxed();

    // ── Unary and cast ──
    //
    // Casts are restricted to scalar type keywords, which keeps
    // `(expr)` and `(type)expr` unambiguous.

    let cast_type = choice((
        just(Token::Boolean).map_with(|_, e| TypeSpec {
            kind: TypeSpecKind::Boolean,
            span: e.span(),
        }),
        just(Token::Bit).map_with(|_, e| TypeSpec {
            kind: TypeSpecKind::Bit,
            span: e.span(),
        }),
        just(Token::Float).map_with(|_, e| TypeSpec {
            kind: TypeSpecKind::Float,
            span: e.span(),
        }),
        just(Token::Int)
            .ignore_then(
                assign_expr
                    .clone()
                    .delimited_by(just(Token::Lt), just(Token::Gt))
                    .or_not(),
            )
            .map_with(|width, e| TypeSpec {
                kind: match width {
                    Some(w) => TypeSpecKind::ApInt(Box::new(w)),
                    None => TypeSpecKind::Int,
                },
                span: e.span(),
            }),
    ));

    let unary = recursive(|unary| {
        let prefix_op = choice((
            just(Token::PlusPlus).to(UnaryOp::PreIncrement),
            just(Token::MinusMinus).to(UnaryOp::PreDecrement),
            just(Token::Plus).to(UnaryOp::Positive),
            just(Token::Minus).to(UnaryOp::Negative),
            just(Token::Bang).to(UnaryOp::LogicalNot),
            just(Token::Tilde).to(UnaryOp::BitwiseNot),
        ));

        let cast = cast_type
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .then(unary.clone())
            .map_with(|(ty, inner), e| Expr {
                kind: ExprKind::Cast {
                    ty,
                    expr: Box::new(inner),
                },
                span: e.span(),
            });

        let prefixed = prefix_op
            .then(unary)
            .map_with(|(op, operand), e| Expr {
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                span: e.span(),
            });

        choice((cast, prefixed, postfix.clone()))
    })
    .boxed();

    // ── Binary operator tiers (C precedence, left associative) ──

    macro_rules! binary_tier {
        ($lower:expr, $ops:expr) => {
            $lower
                .clone()
                .foldl_with($ops.then($lower).repeated(), |lhs, (op, rhs), e| Expr {
                    kind: ExprKind::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    span: e.span(),
                })
                .boxed()
        };
    }

    let mul = binary_tier!(
        unary,
        choice((
            just(Token::Star).to(BinaryOp::Mul),
            just(Token::Slash).to(BinaryOp::Div),
            just(Token::Percent).to(BinaryOp::Rem),
        ))
    );
    let add = binary_tier!(
        mul,
        choice((
            just(Token::Plus).to(BinaryOp::Add),
            just(Token::Minus).to(BinaryOp::Sub),
        ))
    );
    let shift = binary_tier!(
        add,
        choice((
            just(Token::Shl).to(BinaryOp::Shl),
            just(Token::Shr).to(BinaryOp::Shr),
        ))
    );

    let relational = shift
        .clone()
        .foldl_with(
            choice((
                just(Token::Lt).to(RelOp::Less),
                just(Token::Le).to(RelOp::LessEqual),
                just(Token::Gt).to(RelOp::Greater),
                just(Token::Ge).to(RelOp::GreaterEqual),
            ))
            .then(shift)
            .repeated(),
            |lhs, (op, rhs), e| Expr {
                kind: ExprKind::Relational {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span: e.span(),
            },
        )
        .boxed();

    let equality = relational
        .clone()
        .foldl_with(
            choice((
                just(Token::EqEq).to(RelOp::Equal),
                just(Token::Ne).to(RelOp::NotEqual),
            ))
            .then(relational)
            .repeated(),
            |lhs, (op, rhs), e| Expr {
                kind: ExprKind::Relational {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span: e.span(),
            },
        )
        .boxed();

    let bit_and = binary_tier!(equality, just(Token::Amp).to(BinaryOp::BitAnd));
    let bit_xor = binary_tier!(bit_and, just(Token::Caret).to(BinaryOp::BitXor));
    let bit_or = binary_tier!(bit_xor, just(Token::VBar).to(BinaryOp::BitOr));

    let logic_and = bit_or
        .clone()
        .foldl_with(
            just(Token::AndAnd).ignore_then(bit_or).repeated(),
            |lhs, rhs, e| Expr {
                kind: ExprKind::Logical {
                    op: LogicalOp::And,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span: e.span(),
            },
        )
        .boxed();

    let logic_or = logic_and
        .clone()
        .foldl_with(
            just(Token::OrOr).ignore_then(logic_and).repeated(),
            |lhs, rhs, e| Expr {
                kind: ExprKind::Logical {
                    op: LogicalOp::Or,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span: e.span(),
            },
        )
        .boxed();

    // ── Assignment (right associative; lvalue-ness checked in sema) ──

    let assign_op = choice((
        just(Token::Assign).to(None),
        just(Token::PlusAssign).to(Some(BinaryOp::Add)),
        just(Token::MinusAssign).to(Some(BinaryOp::Sub)),
        just(Token::StarAssign).to(Some(BinaryOp::Mul)),
        just(Token::SlashAssign).to(Some(BinaryOp::Div)),
        just(Token::PercentAssign).to(Some(BinaryOp::Rem)),
        just(Token::AmpAssign).to(Some(BinaryOp::BitAnd)),
        just(Token::PipeAssign).to(Some(BinaryOp::BitOr)),
        just(Token::CaretAssign).to(Some(BinaryOp::BitXor)),
        just(Token::ShlAssign).to(Some(BinaryOp::Shl)),
        just(Token::ShrAssign).to(Some(BinaryOp::Shr)),
    ));

    assign_expr.define(
        logic_or
            .clone()
            .then(assign_op.then(assign_expr.clone()).or_not())
            .map_with(|(lhs, rest), e| match rest {
                Some((op, rhs)) => Expr {
                    kind: ExprKind::Assign {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    span: e.span(),
                },
                None => lhs,
            }),
    );

    // Full expressions allow the comma operator; argument lists do not.
    expr.define(
        assign_expr
            .clone()
            .foldl_with(
                just(Token::Comma)
                    .ignore_then(assign_expr.clone())
                    .repeated(),
                |lhs, rhs, e| Expr {
                    kind: ExprKind::Comma {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    span: e.span(),
                },
            ),
    );

    // ── Variable declarations ──
    //
    // Initializers accept either an expression or a brace-enclosed list.

    let init_list = assign_expr
        .clone()
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBrace), just(Token::RBrace))
        .map_with(|elems, e| Expr {
            kind: ExprKind::InitList(elems),
            span: e.span(),
        });

    let initializer = init_list.or(assign_expr.clone());

    let var_decl = type_spec
        .clone()
        .then(ident.clone())
        .then(just(Token::Assign).ignore_then(initializer).or_not())
        .map_with(|((ty, name), init), e| VarDecl {
            ty,
            name,
            initializer: init,
            span: e.span(),
        })
        .boxed();

    let var_decl_stmt = var_decl
        .clone()
        .then_ignore(just(Token::Semicolon))
        .map_with(|decl, e| Stmt {
            kind: StmtKind::VarDecl(decl),
            span: e.span(),
        });

    // ── Statements ──

    let block = stmt
        .clone()
        .repeated()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LBrace), just(Token::RBrace));

    // A single statement is normalized into a one-element block.
    let stmt_or_block = block.clone().or(stmt.clone().map(|s: Stmt| vec![s]));

    let push_stmt = just(Token::Push)
        .ignore_then(
            assign_expr
                .clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then_ignore(just(Token::Semicolon))
        .map_with(|value, e| Stmt {
            kind: StmtKind::Push(value),
            span: e.span(),
        });

    let add_stmt = just(Token::Add)
        .ignore_then(ident.clone())
        .then(
            assign_expr
                .clone()
                .separated_by(just(Token::Comma))
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen))
                .or_not(),
        )
        .then_ignore(just(Token::Semicolon))
        .map_with(|(name, args), e| Stmt {
            kind: StmtKind::Add {
                name,
                args: args.unwrap_or_default(),
            },
            span: e.span(),
        });

    let weight_list = assign_expr
        .clone()
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen))
        .or_not()
        .map(Option::unwrap_or_default);

    let split_stmt = just(Token::Split)
        .ignore_then(choice((
            just(Token::Duplicate).to(SplitSpec::Duplicate),
            just(Token::Roundrobin)
                .ignore_then(weight_list.clone())
                .map(SplitSpec::RoundRobin),
        )))
        .then_ignore(just(Token::Semicolon))
        .map_with(|spec, e| Stmt {
            kind: StmtKind::Split(spec),
            span: e.span(),
        });

    let join_stmt = just(Token::Join)
        .ignore_then(just(Token::Roundrobin))
        .ignore_then(weight_list)
        .then_ignore(just(Token::Semicolon))
        .map_with(|weights, e| Stmt {
            kind: StmtKind::Join(JoinSpec { weights }),
            span: e.span(),
        });

    let if_stmt = just(Token::If)
        .ignore_then(
            expr.clone()
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then(stmt_or_block.clone())
        .then(
            just(Token::Else)
                .ignore_then(stmt_or_block.clone())
                .or_not(),
        )
        .map_with(|((condition, then_block), else_block), e| Stmt {
            kind: StmtKind::If {
                condition,
                then_block,
                else_block,
            },
            span: e.span(),
        });

    let expr_stmt = expr
        .clone()
        .then_ignore(just(Token::Semicolon))
        .map_with(|inner, e| Stmt {
            kind: StmtKind::Expr(inner),
            span: e.span(),
        });

    let for_init = var_decl_stmt.clone().or(expr_stmt.clone());

    let for_stmt = just(Token::For)
        .ignore_then(just(Token::LParen))
        .ignore_then(
            for_init
                .map(|s| Some(Box::new(s)))
                .or(just(Token::Semicolon).to(None)),
        )
        .then(expr.clone().or_not().then_ignore(just(Token::Semicolon)))
        .then(expr.clone().or_not().then_ignore(just(Token::RParen)))
        .then(stmt_or_block.clone())
        .map_with(|(((init, condition), step), body), e| Stmt {
            kind: StmtKind::For {
                init,
                condition,
                step,
                body,
            },
            span: e.span(),
        });

    let break_stmt = just(Token::Break)
        .then_ignore(just(Token::Semicolon))
        .map_with(|_, e| Stmt {
            kind: StmtKind::Break,
            span: e.span(),
        });

    let continue_stmt = just(Token::Continue)
        .then_ignore(just(Token::Semicolon))
        .map_with(|_, e| Stmt {
            kind: StmtKind::Continue,
            span: e.span(),
        });

    let return_stmt = just(Token::Return)
        .ignore_then(expr.clone().or_not())
        .then_ignore(just(Token::Semicolon))
        .map_with(|value, e| Stmt {
            kind: StmtKind::Return(value),
            span: e.span(),
        });

    stmt.define(
        choice((
            push_stmt,
            add_stmt,
            split_stmt,
            join_stmt,
            if_stmt,
            for_stmt,
            break_stmt,
            continue_stmt,
            return_stmt,
            var_decl_stmt.clone(),
            expr_stmt,
        ))
        .boxed(),
    );

    // ── Parameters ──

    let params = type_spec
        .clone()
        .then(ident.clone())
        .map_with(|(ty, name), e| Param {
            ty,
            name,
            span: e.span(),
        })
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen))
        .or_not()
        .map(Option::unwrap_or_default);

    // ── Work blocks ──
    //
    // Rate clauses may appear in any order before the body; duplicates of
    // the same clause are a parse error.

    #[derive(Clone)]
    enum RateKind {
        Peek,
        Pop,
        Push,
    }

    let rate_clause = choice((
        just(Token::Peek).to(RateKind::Peek),
        just(Token::Pop).to(RateKind::Pop),
        just(Token::Push).to(RateKind::Push),
    ))
    .then(assign_expr.clone());

    let work_body = rate_clause
        .repeated()
        .collect::<Vec<_>>()
        .then(block.clone())
        .try_map(|(rates, statements), span| {
            let mut peek_rate = None;
            let mut pop_rate = None;
            let mut push_rate = None;
            for (kind, rate) in rates {
                let slot = match kind {
                    RateKind::Peek => &mut peek_rate,
                    RateKind::Pop => &mut pop_rate,
                    RateKind::Push => &mut push_rate,
                };
                if slot.is_some() {
                    return Err(Rich::custom(span, "duplicate rate clause"));
                }
                *slot = Some(rate);
            }
            Ok(WorkBlock {
                peek_rate,
                pop_rate,
                push_rate,
                statements,
                span,
            })
        });

    // ── Filter declarations ──

    enum FilterItem {
        Var(VarDecl),
        Init(WorkBlock),
        Prework(WorkBlock),
        Work(WorkBlock),
    }

    let filter_item = choice((
        just(Token::Init).ignore_then(work_body.clone()).map(FilterItem::Init),
        just(Token::Prework)
            .ignore_then(work_body.clone())
            .map(FilterItem::Prework),
        just(Token::Work).ignore_then(work_body.clone()).map(FilterItem::Work),
        var_decl
            .clone()
            .then_ignore(just(Token::Semicolon))
            .map(FilterItem::Var),
    ));

    let stream_header = type_spec
        .clone()
        .then_ignore(just(Token::Arrow))
        .then(type_spec.clone());

    let filter_decl = stream_header
        .clone()
        .then(just(Token::Stateful).or_not())
        .then_ignore(just(Token::Filter))
        .then(ident.clone())
        .then(params.clone())
        .then(
            filter_item
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .try_map(|(((((input, output), stateful), name), params), items), span| {
            let mut vars = Vec::new();
            let mut init = None;
            let mut prework = None;
            let mut work = None;
            for item in items {
                match item {
                    FilterItem::Var(v) => vars.push(v),
                    FilterItem::Init(b) if init.is_none() => init = Some(b),
                    FilterItem::Prework(b) if prework.is_none() => prework = Some(b),
                    FilterItem::Work(b) if work.is_none() => work = Some(b),
                    _ => {
                        return Err(Rich::custom(span, "duplicate work block"));
                    }
                }
            }
            let Some(work) = work else {
                return Err(Rich::custom(
                    span,
                    format!("filter '{}' has no work block", name.name),
                ));
            };
            Ok(StreamDecl::Filter(FilterDecl {
                input_type: input,
                output_type: output,
                stateful: stateful.is_some(),
                name,
                params,
                vars,
                init,
                prework,
                work,
                span,
            }))
        });

    // ── Pipeline / splitjoin declarations ──

    let pipeline_decl = stream_header
        .clone()
        .then_ignore(just(Token::Pipeline))
        .then(ident.clone())
        .then(params.clone())
        .then(block.clone())
        .map_with(|((((input, output), name), params), statements), e| {
            StreamDecl::Pipeline(PipelineDecl {
                input_type: input,
                output_type: output,
                name,
                params,
                statements,
                span: e.span(),
            })
        });

    let splitjoin_decl = stream_header
        .then_ignore(just(Token::Splitjoin))
        .then(ident.clone())
        .then(params.clone())
        .then(block.clone())
        .map_with(|((((input, output), name), params), statements), e| {
            StreamDecl::SplitJoin(SplitJoinDecl {
                input_type: input,
                output_type: output,
                name,
                params,
                statements,
                span: e.span(),
            })
        });

    // ── Struct declarations ──

    let struct_decl = just(Token::Struct)
        .ignore_then(ident.clone())
        .then(
            type_spec
                .clone()
                .then(ident.clone())
                .then_ignore(just(Token::Semicolon))
                .map_with(|(ty, name), e| StructField {
                    ty,
                    name,
                    span: e.span(),
                })
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .map_with(|(name, fields), e| StructDecl {
            name,
            fields,
            span: e.span(),
        });

    // ── Helper functions: T name(params) { body } ──

    let function_decl = type_spec
        .clone()
        .then(ident.clone())
        .then(params)
        .then(block)
        .map_with(|(((return_type, name), params), body), e| FunctionDecl {
            return_type,
            name,
            params,
            body,
            span: e.span(),
        });

    // ── Program ──

    enum TopLevel {
        Struct(StructDecl),
        Function(FunctionDecl),
        Stream(StreamDecl),
    }

    let top_level = choice((
        struct_decl.map(TopLevel::Struct),
        filter_decl.map(TopLevel::Stream),
        pipeline_decl.map(TopLevel::Stream),
        splitjoin_decl.map(TopLevel::Stream),
        function_decl.map(TopLevel::Function),
    ));

    top_level
        .repeated()
        .collect::<Vec<_>>()
        .then_ignore(end())
        .map_with(|items, e| {
            let mut program = Program {
                structs: Vec::new(),
                functions: Vec::new(),
                streams: Vec::new(),
                span: e.span(),
            };
            for item in items {
                match item {
                    TopLevel::Struct(s) => program.structs.push(s),
                    TopLevel::Function(f) => program.functions.push(f),
                    TopLevel::Stream(s) => program.streams.push(s),
                }
            }
            program
        })
}
